use std::env;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde_json::Value;

const DEFAULT_URL: &str = "http://127.0.0.1:5000/health";

/// Exits non-zero unless the service answers and reports a loaded model.
fn main() -> Result<()> {
    let url = env::args().nth(1).unwrap_or_else(|| DEFAULT_URL.to_string());
    let url = Url::parse(&url).with_context(|| format!("Invalid URL {url}"))?;

    let response = reqwest::blocking::get(url)?;
    if !response.status().is_success() {
        bail!("Health check failed with status {}", response.status());
    }

    let body: Value = serde_json::from_str(&response.text()?)?;
    if body["model_loaded"] != Value::Bool(true) {
        bail!("Service is up but the model is not loaded: {body}");
    }
    Ok(())
}

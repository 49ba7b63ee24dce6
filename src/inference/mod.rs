pub mod chat_template;
pub mod host;
pub mod model_config;
pub mod models;
pub mod text_pipeline;

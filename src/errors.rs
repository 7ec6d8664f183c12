use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Camera stream error: {message}")]
    Stream { message: String },

    #[error("Encoder error: {message}")]
    Encoder { message: String },

    #[error("Segment sink error: {message}")]
    Sink { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("Image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl RecorderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream { message: message.into() }
    }

    pub fn encoder(message: impl Into<String>) -> Self {
        Self::Encoder { message: message.into() }
    }

    pub fn sink(message: impl Into<String>) -> Self {
        Self::Sink { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, RecorderError>;

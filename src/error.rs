use thiserror::Error;

#[derive(Error, Debug)]
pub enum KpiError {
    #[error("Extraction failed for {kpi}: {details}")]
    Extraction { kpi: String, details: String },

    #[error("Validation failed for {key}: {details}")]
    Validation { key: String, details: String },

    #[error("Load into {table} failed: {details}")]
    Load { table: String, details: String },

    #[error("Invalid reporting window: {0}")]
    InvalidWindow(String),

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Invalid KPI rules: {0}")]
    InvalidRules(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl KpiError {
    pub fn load(table: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Load {
            table: table.into(),
            details: err.to_string(),
        }
    }

    pub fn extraction(kpi: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Extraction {
            kpi: kpi.into(),
            details: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KpiError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("campaign {0} not found")]
    CampaignNotFound(i64),

    #[error("contact {0} not found")]
    ContactNotFound(i64),

    #[error("segment {0} not found")]
    SegmentNotFound(i64),

    #[error("segment {id} has a malformed condition tree: {source}")]
    SegmentInvalid {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("campaign {campaign_id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        campaign_id: i64,
        from: String,
        to: String,
    },

    #[error("insufficient balance for account {account_id}")]
    InsufficientBalance { account_id: String },

    #[error("unknown link token {0}")]
    UnknownToken(String),

    #[error("link token {0} has expired")]
    ExpiredToken(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

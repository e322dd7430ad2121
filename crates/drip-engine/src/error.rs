use thiserror::Error;

use drip_core::Channel;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("database error: {0}")]
    Db(#[from] drip_db::DbError),

    #[error("send request names no contacts, segments or audience")]
    EmptySendSpec,

    #[error("no eligible recipients for this send request")]
    EmptyAudience,

    #[error("segment {id} has a malformed condition tree: {source}")]
    SegmentInvalid {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("campaign {campaign_id} has unknown channel '{channel}'")]
    UnknownChannel { campaign_id: i64, channel: String },

    #[error("no adapter registered for channel {0:?}")]
    NoAdapter(Channel),

    #[error("campaign {campaign_id} cannot be cancelled from status '{status}'")]
    NotCancellable { campaign_id: i64, status: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

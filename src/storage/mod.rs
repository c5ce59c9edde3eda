mod feeds;
mod jobs;
mod posts;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    ExtractionStatus, Feed, FeedOutcome, FeedOutcomeStatus, FeedRegistration, FeedStatus,
    IngestionJob, InsertOutcome, JobOutcome, JobStatus, NewPost, Post, StorageError,
};

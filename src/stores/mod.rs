pub(crate) mod postgres;
pub(crate) mod s3;

pub use postgres::PostgresRecordStore;
pub use s3::S3ObjectStore;

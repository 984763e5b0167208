pub mod job;
pub mod pool;
pub mod upload;

pub use job::JobRepository;
pub use pool::{run_migrations, setup_database, MIGRATOR};
pub use upload::UploadRepository;

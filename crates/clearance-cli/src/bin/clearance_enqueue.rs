use anyhow::{Context, Result};
use clap::Parser;

use clearance_cli::init_telemetry;
use clearance_core::constants::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TEMP_KEY_PREFIX};
use clearance_core::models::{is_valid_file_id, NewUpload};
use clearance_core::{DatabaseConfig, LogFormat};
use clearance_db::{setup_database, UploadRepository};
use clearance_services::KeyLayout;

#[derive(Parser, Debug)]
#[command(name = "clearance-enqueue")]
#[command(about = "Register an uploaded object and enqueue its virus scan")]
struct Args {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    /// External file id assigned by the upload transport
    #[arg(long)]
    file_id: String,

    /// Subject identifier of the uploading user
    #[arg(long)]
    owner: String,

    /// Original file name as sent by the client
    #[arg(long)]
    file_name: String,

    /// Object key of the assembled upload (default: <temp prefix>/<owner>/<file id>)
    #[arg(long)]
    object_key: Option<String>,

    #[arg(long, env = "TEMP_KEY_PREFIX", default_value = DEFAULT_TEMP_KEY_PREFIX)]
    temp_prefix: String,

    #[arg(long, env = "JOB_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: i32,

    /// Print the created rows as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn new_upload(&self) -> Result<NewUpload> {
        if !is_valid_file_id(&self.file_id) {
            anyhow::bail!("Invalid file id: {}", self.file_id);
        }
        if self.max_attempts < 1 {
            anyhow::bail!("--max-attempts must be at least 1");
        }

        let object_key = match &self.object_key {
            Some(key) => key.clone(),
            None => KeyLayout::new(&self.temp_prefix, "")
                .temp_key(&self.owner, &self.file_id)
                .context("Failed to derive object key")?,
        };

        Ok(NewUpload {
            file_id: self.file_id.clone(),
            owner_user_id: self.owner.clone(),
            original_file_name: self.file_name.clone(),
            object_key,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_telemetry(LogFormat::Pretty)?;

    let new_upload = args.new_upload()?;

    let pool = setup_database(&DatabaseConfig {
        url: args.database_url.clone(),
        max_connections: 2,
        timeout_seconds: 30,
    })
    .await?;

    let (upload, job) = UploadRepository::new(pool.clone())
        .register_completed_upload(&new_upload, args.max_attempts)
        .await?;
    pool.close().await;

    if args.json {
        let output = serde_json::json!({
            "uploadId": upload.upload_id,
            "jobId": job.id,
            "objectKey": upload.object_key,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Registered upload {} ({}) and enqueued job {}",
            upload.upload_id, upload.object_key, job.id
        );
    }

    Ok(())
}

use std::env;
use std::error::Error;

use rand::distributions::Alphanumeric;
use rand::Rng;
use rusoto_core::Region;
use rusoto_s3::{CreateBucketRequest, S3Client, S3};

pub const ACCESS_KEY: &str = "minio";
pub const SECRET_KEY: &str = "minio1234";
pub const ENDPOINT_HOST: &str = "127.0.0.1:9000";

pub fn log_init(module_name: &str) {
    env::set_var("RUST_LOG", format!("{module_name},s3_transport"));
    env::set_var("RUST_LOG_STYLE", "always");
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn generate_unique_name() -> String {
    let data: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    format!("test-{data}").to_lowercase()
}

/// Brings up a local MinIO container and sets the environment variables
/// `s3_transport::Config::from_env` reads, an `execute_in_docker!` harness
/// built around `testcontainers`.
#[macro_export]
macro_rules! execute_in_docker {
    ($closure:tt) => {{
        use std::io::Read;
        use testcontainers::images::generic::{GenericImage, Stream, WaitFor};
        use testcontainers::{clients, Docker, Image};

        let docker = clients::Cli::default();
        let image = GenericImage::new(format!("{}:{}", "minio/minio", "latest"))
            .with_mapped_port((9000, 9000))
            .with_env_var("MINIO_ACCESS_KEY", "minio")
            .with_env_var("MINIO_SECRET_KEY", "minio1234")
            .with_wait_for(WaitFor::LogMessage {
                message: "Browser Access:".to_string(),
                stream: Stream::StdOut,
            })
            .with_args(vec!["server".to_string(), "/data".to_string()]);

        std::env::set_var("S3_ACCESS_KEY_ID", "minio");
        std::env::set_var("S3_SECRET_ACCESS_KEY", "minio1234");
        std::env::set_var("S3_DEFAULT_HOSTNAME", "127.0.0.1:9000");
        std::env::set_var("S3_PROTO", "http");

        let container = docker.run(image);
        let result = $closure().await;
        container.stop();
        if result.is_err() {
            let mut buffer = String::new();
            container.logs().stdout.read_to_string(&mut buffer).unwrap();
            println!(" - * - * - * - * - * - * - * - * - * - * - * - *");
            println!("Error in test, dumping container logs:");
            println!("Stdout: {buffer}");
            buffer.clear();
            container.logs().stderr.read_to_string(&mut buffer).unwrap();
            println!("Stderr: {buffer}");
            println!(" - * - * - * - * - * - * - * - * - * - * - * - *");
        }
        result
    }};
}

pub async fn create_client_and_bucket(bucket: &str) -> Result<S3Client, Box<dyn Error>> {
    let region = Region::Custom {
        name: "us-east-1".to_owned(),
        endpoint: format!("http://{ENDPOINT_HOST}"),
    };
    let client = S3Client::new(region);
    client
        .create_bucket(CreateBucketRequest {
            bucket: bucket.to_string(),
            ..Default::default()
        })
        .await?;
    Ok(client)
}

use std::cmp::max;
use std::convert::TryInto;
use std::env;
use std::fs::File;
use std::io::{Read, Write};

use clap::{App, AppSettings, Arg};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use tokio::runtime;

use s3_transport::{Config, OpenMode, Transport};

fn init_logging(verbose: bool) {
    if verbose {
        env::set_var("RUST_LOG", "s3_transport=debug");
    } else {
        env::set_var("RUST_LOG", "s3_transport=info");
    }
    let _ = env_logger::builder().try_init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    runtime::Builder::new_multi_thread()
        .worker_threads(max(2, num_cpus::get()))
        .enable_all()
        .build()?
        .block_on(app())
}

fn progress_bar(total: u64, verbose: bool) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let template = if verbose {
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})\n"
    } else {
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})"
    };
    pb.set_style(ProgressStyle::default_bar().template(template).progress_chars("#>-"));
    pb
}

async fn app() -> Result<(), Box<dyn std::error::Error>> {
    let app = App::new("S3 streaming transport")
        .version("0.1")
        .author("Anders Aagaard <aagaande@gmail.com>")
        .about("Exercises the S3 streaming transport directly, for debugging a resource-plugin integration")
        .subcommand(
            App::new("put")
                .about("Upload a local file to an S3 object through the transport")
                .arg(Arg::new("path").required(true).help("/bucket/key destination"))
                .arg(Arg::new("file").required(true).help("local file to upload"))
                .arg(Arg::new("verbose").short('v').help("Verbose logging")),
        )
        .subcommand(
            App::new("get")
                .about("Download an S3 object to a local file through the transport")
                .arg(Arg::new("path").required(true).help("/bucket/key source"))
                .arg(Arg::new("file").required(true).help("local file to write"))
                .arg(Arg::new("verbose").short('v').help("Verbose logging")),
        )
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .get_matches();

    match app.subcommand() {
        Some(("put", args)) => {
            let verbose = args.occurrences_of("verbose") > 0;
            init_logging(verbose);
            let path = args.value_of("path").unwrap();
            let file_path = args.value_of("file").unwrap();

            let mut file = File::open(file_path)?;
            let total = file.metadata()?.len();
            let mut data = Vec::with_capacity(total.try_into()?);
            file.read_to_end(&mut data)?;

            let config = Config::from_env()?;
            let pb = progress_bar(total, verbose);
            let mut transport = Transport::open(config, path, OpenMode::write_truncate())?;
            transport.set_progress_callback(std::sync::Arc::new({
                let pb = pb.clone();
                move |bytes_sent| pb.set_position(bytes_sent)
            }));

            info!("uploading {file_path} to {path} ({total} bytes)");
            transport.write(&data)?;
            transport.close()?;
            pb.finish_with_message("upload complete");
        }
        Some(("get", args)) => {
            let verbose = args.occurrences_of("verbose") > 0;
            init_logging(verbose);
            let path = args.value_of("path").unwrap();
            let file_path = args.value_of("file").unwrap();

            let config = Config::from_env()?;
            let mut transport = Transport::open(config, path, OpenMode::read_only())?;
            let pb = progress_bar(0, verbose);

            let mut out = File::create(file_path)?;
            let mut buf = [0u8; 64 * 1024];
            let mut total_read: u64 = 0;
            loop {
                let n = transport.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
                total_read += n as u64;
                pb.set_position(total_read);
            }
            transport.close()?;
            pb.finish_with_message("download complete");
            info!("downloaded {path} to {file_path} ({total_read} bytes)");
        }
        _ => {}
    }

    Ok(())
}

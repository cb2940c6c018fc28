//! Command line arguments.

use std::path::PathBuf;

#[derive(clap::Parser)]
#[command(version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// Sign a firmware image and write the job document announcing it.
    Sign {
        /// Path to the PEM-encoded P-256 secret key, PKCS#8 or SEC1.
        #[clap(long)]
        key: PathBuf,
        /// The firmware image.
        #[clap(short, long)]
        input: PathBuf,
        /// Id of the job.
        #[clap(long)]
        job_id: String,
        /// Stream the image is served on.
        #[clap(long)]
        stream: String,
        /// Id of the image within the stream.
        #[clap(long, default_value_t = 0)]
        file_id: u32,
        /// Destination of the image on the device.
        #[clap(long, default_value = "/firmware")]
        file_path: String,
        /// Reference to the key the device verifies with.
        #[clap(long, default_value = "ota-signer.pem")]
        cert_file: String,
        /// Block size the device requests the image in.
        #[clap(long)]
        block_size: Option<u32>,
        /// Path to write the job document to, stdout when omitted.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Check a firmware image against the signature in a job document.
    Verify {
        /// Path to the PEM-encoded public key.
        #[clap(long)]
        pubkey: PathBuf,
        /// The firmware image.
        #[clap(short, long)]
        input: PathBuf,
        /// The job document.
        #[clap(long)]
        job: PathBuf,
    },
}

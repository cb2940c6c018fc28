use {
    clap::Parser,
    consts::{FILE_BLOCK_SIZE, MAX_JOB_ID_LEN, MAX_STREAM_NAME_LEN},
    ota_agent::verify::PublicKey,
    p256::{
        ecdsa::SigningKey,
        pkcs8::DecodePrivateKey,
    },
    std::path::PathBuf,
};

mod cli;

/// Program arguments, with the keys loaded.
#[derive(Debug, Clone)]
pub enum Args {
    /// Sign a firmware image.
    Sign {
        key: SigningKey,
        input: PathBuf,
        job: JobParams,
        output: Option<PathBuf>,
    },
    /// Verify a firmware image against a job document.
    Verify {
        pubkey: PublicKey,
        input: PathBuf,
        job: PathBuf,
    },
}

/// Fields of the job document that do not depend on the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobParams {
    pub job_id: String,
    pub stream: String,
    pub file_id: u32,
    pub file_path: String,
    pub cert_file: String,
    pub block_size: u32,
}

pub fn args<I, T>(args: I) -> Result<Args, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = cli::Args::try_parse_from(args).map_err(Error::Cli)?;
    match cli.command {
        cli::Command::Sign {
            key,
            input,
            job_id,
            stream,
            file_id,
            file_path,
            cert_file,
            block_size,
            output,
        } => {
            if job_id.is_empty() || job_id.len() > MAX_JOB_ID_LEN {
                return Err(Error::InvalidJobId(job_id));
            }
            if stream.is_empty() || stream.len() > MAX_STREAM_NAME_LEN || stream.contains('/') {
                return Err(Error::InvalidStream(stream));
            }
            let block_size = block_size.unwrap_or(FILE_BLOCK_SIZE as u32);
            if block_size == 0 || block_size as usize > FILE_BLOCK_SIZE {
                return Err(Error::InvalidBlockSize(block_size));
            }
            let pem = std::fs::read_to_string(key).map_err(Error::ReadKeyFile)?;
            let key = SigningKey::from_pkcs8_pem(&pem)
                .or_else(|_| p256::SecretKey::from_sec1_pem(&pem).map(SigningKey::from))
                .map_err(|_| Error::InvalidKey)?;
            Ok(Args::Sign {
                key,
                input,
                job: JobParams {
                    job_id,
                    stream,
                    file_id,
                    file_path,
                    cert_file,
                    block_size,
                },
                output,
            })
        }
        cli::Command::Verify { pubkey, input, job } => {
            let pem = std::fs::read_to_string(pubkey).map_err(Error::ReadPubkeyFile)?;
            let pubkey = PublicKey::from_pem(&pem).map_err(|_| Error::InvalidPubkey)?;
            Ok(Args::Verify { pubkey, input, job })
        }
    }
}

#[derive(Debug)]
pub enum Error {
    Cli(clap::Error),
    InvalidBlockSize(u32),
    InvalidJobId(String),
    InvalidKey,
    InvalidPubkey,
    InvalidStream(String),
    ReadKeyFile(std::io::Error),
    ReadPubkeyFile(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Cli(e) => write!(f, "{}", e.render().ansi()),
            Error::InvalidBlockSize(size) => {
                write!(f, "block size {size} is not in 1..={FILE_BLOCK_SIZE}")
            }
            Error::InvalidJobId(id) => write!(f, r#"invalid job id: "{id}""#),
            Error::InvalidKey => write!(f, "key file is not a PEM-encoded P-256 secret key"),
            Error::InvalidPubkey => {
                write!(f, "public key file is not a PEM-encoded P-256 public key")
            }
            Error::InvalidStream(stream) => write!(f, r#"invalid stream name: "{stream}""#),
            Error::ReadKeyFile(e) => write!(f, "failed to read key file: {e}"),
            Error::ReadPubkeyFile(e) => write!(f, "failed to read public key file: {e}"),
        }
    }
}

impl std::error::Error for Error {}

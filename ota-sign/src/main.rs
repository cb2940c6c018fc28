use {
    base64::{engine::general_purpose::STANDARD, Engine as _},
    colored::Colorize,
    ota_agent::{
        error::{ParseError, VerifyError},
        job,
        verify::{self, P256Verifier},
    },
    p256::ecdsa::{signature::hazmat::PrehashSigner, Signature},
    sha2::Digest,
    std::{ffi::OsString, io::Write},
    tracing_subscriber::{fmt, prelude::*, EnvFilter},
};

mod args;

#[cfg(test)]
mod tests;

fn main() -> std::process::ExitCode {
    // Tracing using RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    main_args(
        std::env::args_os(),
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    )
    .into()
}

/// Run the tool and turn its outcome into an exit code, reporting errors
/// on `stderr`.
fn main_args<I, T>(args: I, stdout: impl Write, mut stderr: impl Write) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let Err(e) = run(args, stdout) else {
        return ExitCode::SUCCESS;
    };
    tracing::debug!("{e:?}");
    let report = match &e {
        // Clap formats its own messages, help included.
        Error::Args(args::Error::Cli(_)) => writeln!(stderr, "{e}"),
        _ => writeln!(stderr, "{} {e}", "error:".bold().red()),
    };
    if report.is_err() {
        tracing::error!("{e}");
    }
    e.exit_code()
}

fn run<I, T>(args: I, mut stdout: impl Write) -> Result<(), Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match args::args(args)? {
        args::Args::Sign {
            key,
            input,
            job,
            output,
        } => {
            let image = std::fs::read(&input).map_err(Error::ReadInputFile)?;
            let file_size = check_image_size(&image, job.block_size)?;
            let digest = sha2::Sha256::digest(&image);
            let signature: Signature = key.sign_prehash(&digest).map_err(|_| Error::Sign)?;
            tracing::debug!("signed {} bytes, sha256 {digest:x}", image.len());

            let document = serde_json::json!({
                "clientToken": "ota-sign",
                "execution": {
                    "jobId": job.job_id,
                    "jobDocument": {
                        "afr_ota": {
                            "version": consts::JOB_DOC_VERSION,
                            "streamname": job.stream,
                            "files": [{
                                "filepath": job.file_path,
                                "filesize": file_size,
                                "fileid": job.file_id,
                                "certfile": job.cert_file,
                                "attr": 0,
                                "blocksize": job.block_size,
                                (consts::SIG_SHA256_ECDSA): STANDARD.encode(signature.to_der().as_bytes()),
                            }],
                        },
                    },
                },
            });
            let document =
                serde_json::to_string_pretty(&document).map_err(Error::SerializeJob)?;

            // The agent must accept what it is handed.
            job::parse(document.as_bytes()).map_err(Error::ParseOutputJob)?;

            match output {
                Some(path) => {
                    std::fs::write(&path, document.as_bytes()).map_err(Error::WriteOutputFile)?;
                    tracing::info!("job document written to {}", path.display());
                }
                None => writeln!(&mut stdout, "{document}").map_err(Error::Stdout)?,
            }
        }
        args::Args::Verify { pubkey, input, job } => {
            let image = std::fs::read(&input).map_err(Error::ReadInputFile)?;
            let raw = std::fs::read(&job).map_err(Error::ReadJobFile)?;
            let job = job::parse(&raw).map_err(Error::ParseJob)?;
            if image.len() != job.file_size as usize {
                return Err(Error::SizeMismatch {
                    image: image.len(),
                    job: job.file_size,
                });
            }
            let mut digest = sha2::Sha256::new();
            for block in image.chunks(job.block_size as usize) {
                digest.update(block);
            }
            verify::finalize(
                digest,
                job.signature_algorithm,
                &job.signature,
                &pubkey,
                &P256Verifier,
            )
            .map_err(Error::Verify)?;
            writeln!(
                &mut stdout,
                "{} job {}, {} bytes in {} blocks",
                "valid".bold().green(),
                job.job_id,
                job.file_size,
                job.block_count(),
            )
            .map_err(Error::Stdout)?;
        }
    }
    Ok(())
}

/// Size of the image, checked against what a device can download.
fn check_image_size(image: &[u8], block_size: u32) -> Result<u32, Error> {
    let size = u32::try_from(image.len()).map_err(|_| Error::ImageTooLarge(image.len()))?;
    if size == 0 {
        return Err(Error::EmptyImage);
    }
    if size.div_ceil(block_size) as usize > consts::MAX_BLOCKS {
        return Err(Error::ImageTooLarge(image.len()));
    }
    Ok(size)
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitCode(u8);

impl ExitCode {
    const SUCCESS: Self = Self(0);
    /// I/O or signing failure
    const FAILURE: Self = Self(1);
    /// Bad arguments or unusable input
    const USAGE: Self = Self(2);
    /// The image does not match its job document
    const INVALID: Self = Self(3);
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        code.0.into()
    }
}

#[derive(Debug)]
enum Error {
    Args(args::Error),
    EmptyImage,
    ImageTooLarge(usize),
    ParseJob(ParseError),
    ParseOutputJob(ParseError),
    ReadInputFile(std::io::Error),
    ReadJobFile(std::io::Error),
    SerializeJob(serde_json::Error),
    Sign,
    SizeMismatch { image: usize, job: u32 },
    Stdout(std::io::Error),
    Verify(VerifyError),
    WriteOutputFile(std::io::Error),
}

impl Error {
    fn exit_code(&self) -> ExitCode {
        match self {
            Error::Args(args::Error::Cli(e)) => ExitCode(e.exit_code().clamp(0, 255) as u8),
            Error::Args(args::Error::ReadKeyFile(_) | args::Error::ReadPubkeyFile(_)) => {
                ExitCode::FAILURE
            }
            Error::Args(_) | Error::EmptyImage | Error::ImageTooLarge(_) => ExitCode::USAGE,
            Error::ParseJob(_) | Error::SizeMismatch { .. } | Error::Verify(_) => {
                ExitCode::INVALID
            }
            Error::ParseOutputJob(_)
            | Error::ReadInputFile(_)
            | Error::ReadJobFile(_)
            | Error::SerializeJob(_)
            | Error::Sign
            | Error::Stdout(_)
            | Error::WriteOutputFile(_) => ExitCode::FAILURE,
        }
    }
}

impl From<args::Error> for Error {
    fn from(e: args::Error) -> Self {
        Error::Args(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Args(e) => write!(f, "{e}"),
            Error::EmptyImage => write!(f, "input file is empty"),
            Error::ImageTooLarge(size) => write!(
                f,
                "image of {size} bytes does not fit in {} blocks",
                consts::MAX_BLOCKS
            ),
            Error::ParseJob(e) => write!(f, "invalid job document: {e}"),
            Error::ParseOutputJob(e) => {
                write!(f, "generated job document does not parse: {e}")
            }
            Error::ReadInputFile(e) => write!(f, "failed to read input file: {e}"),
            Error::ReadJobFile(e) => write!(f, "failed to read job file: {e}"),
            Error::SerializeJob(e) => write!(f, "failed to serialize job document: {e}"),
            Error::Sign => write!(f, "failed to sign the image"),
            Error::SizeMismatch { image, job } => write!(
                f,
                "image is {image} bytes, the job document announces {job}"
            ),
            Error::Stdout(e) => write!(f, "failed to write to stdout: {e}"),
            Error::Verify(e) => write!(f, "signature check failed: {e}"),
            Error::WriteOutputFile(e) => write!(f, "failed to write to output file: {e}"),
        }
    }
}

impl std::error::Error for Error {}

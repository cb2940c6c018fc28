use {
    crate::ExitCode,
    p256::{
        ecdsa::SigningKey,
        pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
    },
    std::io::Write,
};

fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).unwrap()
}

fn key_file(seed: u8) -> tempfile::NamedTempFile {
    let pem = signing_key(seed).to_pkcs8_pem(LineEnding::LF).unwrap();
    create_file(pem.as_bytes())
}

fn pubkey_file(seed: u8) -> tempfile::NamedTempFile {
    let pem = signing_key(seed)
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    create_file(pem.as_bytes())
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

/// Sign `image` with the key from `seed`, writing the job document to a file.
fn sign_to_file(image: &tempfile::NamedTempFile, seed: u8) -> tempfile::NamedTempFile {
    let key = key_file(seed);
    let job = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "sign",
        "--key",
        path(&key),
        "-i",
        path(image),
        "--job-id",
        "AFR_OTA-7",
        "--stream",
        "fw-stream",
        "-o",
        path(&job),
    ]);
    assert_eq!(output.exit_code, ExitCode::SUCCESS);
    assert!(output.stderr.is_empty());
    job
}

/// A signed image verifies against the job document.
#[test]
fn sign_then_verify() {
    let image = create_file(&image(3000));
    let job = sign_to_file(&image, 1);
    let pubkey = pubkey_file(1);
    let output = test([
        "verify",
        "--pubkey",
        path(&pubkey),
        "-i",
        path(&image),
        "--job",
        path(&job),
    ]);
    assert_eq!(output.exit_code, ExitCode::SUCCESS);
    assert!(output.stdout.contains("valid"));
    assert!(output.stdout.contains("AFR_OTA-7"));
    assert!(output.stdout.contains("3000 bytes in 3 blocks"));
    assert!(output.stderr.is_empty());
}

/// Without `--output` the job document goes to stdout, and the agent parses
/// it.
#[test]
fn sign_to_stdout() {
    let image = create_file(&image(2048));
    let key = key_file(1);
    let output = test([
        "sign",
        "--key",
        path(&key),
        "-i",
        path(&image),
        "--job-id",
        "AFR_OTA-8",
        "--stream",
        "fw-stream",
        "--file-id",
        "3",
        "--block-size",
        "512",
    ]);
    assert_eq!(output.exit_code, ExitCode::SUCCESS);
    let job = ota_agent::job::parse(output.stdout.as_bytes()).unwrap();
    assert_eq!(job.job_id, "AFR_OTA-8");
    assert_eq!(job.stream_name, "fw-stream");
    assert_eq!(job.file_id, 3);
    assert_eq!(job.file_size, 2048);
    assert_eq!(job.block_size, 512);
    assert_eq!(job.block_count(), 4);
    assert_eq!(
        job.signature_algorithm,
        ota_agent::job::SignatureAlgorithm::EcdsaP256Sha256
    );
}

/// A SEC1 secret key works as well as a PKCS#8 one.
#[test]
fn sign_with_sec1_key() {
    let image = create_file(&image(100));
    let pem = p256::SecretKey::from_slice(&[1; 32])
        .unwrap()
        .to_sec1_pem(LineEnding::LF)
        .unwrap();
    let key = create_file(pem.as_bytes());
    let output = test([
        "sign",
        "--key",
        path(&key),
        "-i",
        path(&image),
        "--job-id",
        "AFR_OTA-9",
        "--stream",
        "fw-stream",
    ]);
    assert_eq!(output.exit_code, ExitCode::SUCCESS);
    assert!(output.stdout.contains("sig-sha256-ecdsa"));
}

/// One flipped bit in the image fails the check.
#[test]
fn tampered_image() {
    let data = image(3000);
    let image = create_file(&data);
    let job = sign_to_file(&image, 1);
    let pubkey = pubkey_file(1);

    let mut tampered = data.clone();
    tampered[1500] ^= 0x01;
    let tampered = create_file(&tampered);
    let output = test([
        "verify",
        "--pubkey",
        path(&pubkey),
        "-i",
        path(&tampered),
        "--job",
        path(&job),
    ]);
    assert_eq!(output.exit_code, ExitCode::INVALID);
    assert!(output.stderr.contains("error:"));
    assert!(output.stderr.contains("signature check failed"));
    assert!(output.stdout.is_empty());
}

/// An image signed with another key fails the check.
#[test]
fn wrong_key() {
    let image = create_file(&image(3000));
    let job = sign_to_file(&image, 1);
    let pubkey = pubkey_file(2);
    let output = test([
        "verify",
        "--pubkey",
        path(&pubkey),
        "-i",
        path(&image),
        "--job",
        path(&job),
    ]);
    assert_eq!(output.exit_code, ExitCode::INVALID);
    assert!(output.stderr.contains("signature check failed"));
}

/// The image must have the size announced by the job.
#[test]
fn truncated_image() {
    let data = image(3000);
    let image = create_file(&data);
    let job = sign_to_file(&image, 1);
    let truncated = create_file(&data[..2999]);
    let pubkey = pubkey_file(1);
    let output = test([
        "verify",
        "--pubkey",
        path(&pubkey),
        "-i",
        path(&truncated),
        "--job",
        path(&job),
    ]);
    assert_eq!(output.exit_code, ExitCode::INVALID);
    assert!(output
        .stderr
        .contains("image is 2999 bytes, the job document announces 3000"));
}

#[test]
fn missing_key_file() {
    let image = create_file(&image(100));
    let output = test([
        "sign",
        "--key",
        "/nonexistent/key.pem",
        "-i",
        path(&image),
        "--job-id",
        "AFR_OTA-7",
        "--stream",
        "fw-stream",
    ]);
    assert_eq!(output.exit_code, ExitCode::FAILURE);
    assert!(output.stderr.contains("failed to read key file"));
}

#[test]
fn key_file_is_not_a_key() {
    let image = create_file(&image(100));
    let key = create_file(b"not a key");
    let output = test([
        "sign",
        "--key",
        path(&key),
        "-i",
        path(&image),
        "--job-id",
        "AFR_OTA-7",
        "--stream",
        "fw-stream",
    ]);
    assert_eq!(output.exit_code, ExitCode::USAGE);
    assert!(output.stderr.contains("not a PEM-encoded P-256 secret key"));
}

#[test]
fn invalid_block_size() {
    let image = create_file(&image(100));
    let key = key_file(1);
    let output = test([
        "sign",
        "--key",
        path(&key),
        "-i",
        path(&image),
        "--job-id",
        "AFR_OTA-7",
        "--stream",
        "fw-stream",
        "--block-size",
        "0",
    ]);
    assert_eq!(output.exit_code, ExitCode::USAGE);
    assert!(output.stderr.contains("block size 0"));
}

#[test]
fn empty_image() {
    let image = create_file(b"");
    let key = key_file(1);
    let output = test([
        "sign",
        "--key",
        path(&key),
        "-i",
        path(&image),
        "--job-id",
        "AFR_OTA-7",
        "--stream",
        "fw-stream",
    ]);
    assert_eq!(output.exit_code, ExitCode::USAGE);
    assert!(output.stderr.contains("input file is empty"));
}

/// Clap reports missing arguments itself, with its usage exit code.
#[test]
fn missing_arguments() {
    let output = test(["sign", "--job-id", "AFR_OTA-7"]);
    assert_eq!(output.exit_code, ExitCode::USAGE);
    assert!(output.stderr.contains("--key"));
}

fn path(file: &tempfile::NamedTempFile) -> &str {
    file.path().to_str().unwrap()
}

fn test<const N: usize>(args: [&str; N]) -> Output {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit_code = crate::main_args(
        std::iter::once("ota-sign").chain(args),
        &mut stdout,
        &mut stderr,
    );
    println!("* args: {:?}", args);
    println!("* exit_code: {:?}", exit_code);
    println!("* stdout:\n{}", String::from_utf8_lossy(&stdout));
    println!("* stderr:\n{}", String::from_utf8_lossy(&stderr));
    Output {
        exit_code,
        stdout: String::from_utf8(stdout).unwrap(),
        stderr: String::from_utf8(stderr).unwrap(),
    }
}

#[derive(Debug)]
struct Output {
    exit_code: ExitCode,
    stdout: String,
    stderr: String,
}

fn create_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file
}

/// Help is not an error.
#[test]
fn help() {
    let output = test(["--help"]);
    assert_eq!(output.exit_code, ExitCode::SUCCESS);
    assert!(output.stderr.contains("sign"));
    assert!(output.stderr.contains("verify"));
}

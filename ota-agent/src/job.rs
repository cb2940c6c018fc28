// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Job document parsing.
//!
//! A job message either carries no execution (nothing to do) or a complete
//! update job. Parsing is all-or-nothing: any structural problem yields a
//! [`ParseError`] and no document.

use crate::{error::ParseError, version::AppVersion};
use alloc::{string::String, vec::Vec};
use base64::Engine;
use consts::{
    FILE_BLOCK_SIZE, JOB_DOC_VERSION, MAX_BLOCKS, MAX_JOB_ID_LEN, MAX_STREAM_NAME_LEN,
    SIG_SHA1_RSA, SIG_SHA256_ECDSA, SIG_SHA256_RSA,
};
use ota_protocol::SelfTestStep;
use serde::Deserialize;

/// Signature scheme named by the job document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SignatureAlgorithm {
    EcdsaP256Sha256,
    RsaSha1,
    RsaSha256,
}

/// One update job, as handed out by the job service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDocument {
    pub job_id: String,
    pub client_token: Option<String>,
    /// Stream the blocks are served on
    pub stream_name: String,
    pub file_id: u32,
    pub file_size: u32,
    /// Destination of the image on the device
    pub file_path: String,
    pub block_size: u32,
    /// Reference to the key the image was signed with
    pub cert_file: String,
    pub attributes: u32,
    pub signature_algorithm: SignatureAlgorithm,
    pub signature: Vec<u8>,
    /// Set once the job has moved to the self test phase
    pub self_test: Option<SelfTestStep>,
    /// Version of the image that started the update
    pub updated_by: Option<AppVersion>,
}

impl JobDocument {
    /// Number of blocks the image is split into.
    pub fn block_count(&self) -> u32 {
        self.file_size.div_ceil(self.block_size)
    }
}

#[derive(Deserialize)]
struct JobMessage {
    #[serde(rename = "clientToken")]
    client_token: Option<String>,
    execution: Option<Execution>,
}

#[derive(Deserialize)]
struct Execution {
    #[serde(rename = "jobId")]
    job_id: Option<String>,
    #[serde(rename = "statusDetails")]
    status_details: Option<RawStatusDetails>,
    #[serde(rename = "jobDocument")]
    job_document: Option<RawJobDocument>,
}

#[derive(Deserialize)]
struct RawStatusDetails {
    self_test: Option<String>,
    #[serde(rename = "updatedBy")]
    updated_by: Option<String>,
}

#[derive(Deserialize)]
struct RawJobDocument {
    afr_ota: Option<OtaUnit>,
}

#[derive(Deserialize)]
struct OtaUnit {
    version: Option<u32>,
    streamname: Option<String>,
    files: Option<Vec<RawFile>>,
}

#[derive(Deserialize)]
struct RawFile {
    filepath: Option<String>,
    filesize: Option<u32>,
    fileid: Option<u32>,
    certfile: Option<String>,
    attr: Option<u32>,
    blocksize: Option<u32>,
    #[serde(rename = "sig-sha256-ecdsa")]
    sig_sha256_ecdsa: Option<String>,
    #[serde(rename = "sig-sha1-rsa")]
    sig_sha1_rsa: Option<String>,
    #[serde(rename = "sig-sha256-rsa")]
    sig_sha256_rsa: Option<String>,
}

/// Parse a job document, with blocks of the default size unless the document
/// says otherwise. A message without an execution is
/// [`ParseError::MissingField`].
pub fn parse(raw: &[u8]) -> Result<JobDocument, ParseError> {
    parse_job_message(raw, FILE_BLOCK_SIZE as u32)?.ok_or(ParseError::MissingField("execution"))
}

/// Parse a message from a job topic. `Ok(None)` means the service has no job
/// for this device.
pub fn parse_job_message(
    raw: &[u8],
    default_block_size: u32,
) -> Result<Option<JobDocument>, ParseError> {
    let message: JobMessage = serde_json::from_slice(raw).map_err(|_| ParseError::Malformed)?;
    let Some(execution) = message.execution else {
        return Ok(None);
    };
    let job_id = execution.job_id.ok_or(ParseError::MissingField("jobId"))?;
    if job_id.is_empty() || job_id.len() > MAX_JOB_ID_LEN {
        return Err(ParseError::InvalidValue("jobId"));
    }
    let (self_test, updated_by) = match execution.status_details {
        Some(details) => parse_status_details(details)?,
        None => (None, None),
    };
    let unit = execution
        .job_document
        .ok_or(ParseError::MissingField("jobDocument"))?
        .afr_ota
        .ok_or(ParseError::MissingField("afr_ota"))?;
    if unit.version.unwrap_or(JOB_DOC_VERSION) != JOB_DOC_VERSION {
        return Err(ParseError::UnsupportedVersion);
    }
    let stream_name = unit.streamname.ok_or(ParseError::MissingField("streamname"))?;
    if stream_name.is_empty() || stream_name.len() > MAX_STREAM_NAME_LEN {
        return Err(ParseError::InvalidValue("streamname"));
    }
    // Only single file jobs are supported, extra files are ignored.
    let file = unit
        .files
        .and_then(|files| files.into_iter().next())
        .ok_or(ParseError::MissingField("files"))?;
    let file_path = file.filepath.ok_or(ParseError::MissingField("filepath"))?;
    let file_size = file.filesize.ok_or(ParseError::MissingField("filesize"))?;
    let file_id = file.fileid.ok_or(ParseError::MissingField("fileid"))?;
    let cert_file = file.certfile.ok_or(ParseError::MissingField("certfile"))?;
    let block_size = file.blocksize.unwrap_or(default_block_size);
    if block_size == 0 || block_size as usize > FILE_BLOCK_SIZE {
        return Err(ParseError::InvalidValue("blocksize"));
    }
    if file_size == 0 || file_size.div_ceil(block_size) as usize > MAX_BLOCKS {
        return Err(ParseError::InvalidValue("filesize"));
    }
    let (signature_algorithm, key, encoded) = match (
        file.sig_sha256_ecdsa,
        file.sig_sha256_rsa,
        file.sig_sha1_rsa,
    ) {
        (Some(sig), _, _) => (SignatureAlgorithm::EcdsaP256Sha256, SIG_SHA256_ECDSA, sig),
        (None, Some(sig), _) => (SignatureAlgorithm::RsaSha256, SIG_SHA256_RSA, sig),
        (None, None, Some(sig)) => (SignatureAlgorithm::RsaSha1, SIG_SHA1_RSA, sig),
        (None, None, None) => return Err(ParseError::MissingField(SIG_SHA256_ECDSA)),
    };
    let signature = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| ParseError::InvalidValue(key))?;
    if signature.is_empty() {
        return Err(ParseError::InvalidValue(key));
    }

    Ok(Some(JobDocument {
        job_id,
        client_token: message.client_token,
        stream_name,
        file_id,
        file_size,
        file_path,
        block_size,
        cert_file,
        attributes: file.attr.unwrap_or(0),
        signature_algorithm,
        signature,
        self_test,
        updated_by,
    }))
}

fn parse_status_details(
    details: RawStatusDetails,
) -> Result<(Option<SelfTestStep>, Option<AppVersion>), ParseError> {
    let self_test = match details.self_test.as_deref() {
        None => None,
        Some("ready") => Some(SelfTestStep::Ready),
        Some("active") => Some(SelfTestStep::Active),
        Some(_) => return Err(ParseError::InvalidValue("self_test")),
    };
    let updated_by = details
        .updated_by
        .map(|v| AppVersion::parse(&v).ok_or(ParseError::InvalidValue("updatedBy")))
        .transpose()?;
    Ok((self_test, updated_by))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    const SIG: &str = "MEUCIQDsOoVWyuoRVAN8Jmx2XiGy7qeYsvhFX8dlTVnS7JsSCAIgDDyJrwNr2UcAK2CJ4khn9iOz4gAmXj+n5OmBZCmGJs4=";

    fn doc(files: &str) -> String {
        alloc::format!(
            r#"{{"clientToken":"1:dev1","execution":{{"jobId":"AFR_OTA-9","jobDocument":{{"afr_ota":{{"streamname":"s-9","files":[{files}]}}}}}}}}"#
        )
    }

    fn file(extra: &str) -> String {
        alloc::format!(
            r#"{{"filepath":"/fw","filesize":4096,"fileid":0,"certfile":"signer.pem"{extra}}}"#
        )
    }

    fn signed_file() -> String {
        file(&alloc::format!(r#","sig-sha256-ecdsa":"{SIG}""#))
    }

    #[test]
    fn parses_complete_document() {
        let job = parse(doc(&signed_file()).as_bytes()).unwrap();
        assert_eq!(job.job_id, "AFR_OTA-9");
        assert_eq!(job.client_token.as_deref(), Some("1:dev1"));
        assert_eq!(job.stream_name, "s-9");
        assert_eq!(job.file_size, 4096);
        assert_eq!(job.block_size, FILE_BLOCK_SIZE as u32);
        assert_eq!(job.block_count(), 4);
        assert_eq!(job.signature_algorithm, SignatureAlgorithm::EcdsaP256Sha256);
        assert_eq!(job.signature.len(), 71);
        assert_eq!(job.self_test, None);
    }

    #[test]
    fn no_execution_means_no_job() {
        let raw = br#"{"clientToken":"1:dev1","timestamp":1700000000}"#;
        assert_eq!(parse_job_message(raw, 1024), Ok(None));
        assert_eq!(parse(raw), Err(ParseError::MissingField("execution")));
    }

    #[test]
    fn missing_fields() {
        let cases = [
            (
                r#"{"execution":{"jobDocument":{}}}"#.to_string(),
                ParseError::MissingField("jobId"),
            ),
            (
                r#"{"execution":{"jobId":"j"}}"#.to_string(),
                ParseError::MissingField("jobDocument"),
            ),
            (
                r#"{"execution":{"jobId":"j","jobDocument":{}}}"#.to_string(),
                ParseError::MissingField("afr_ota"),
            ),
            (doc(""), ParseError::MissingField("files")),
            (doc(&file("")), ParseError::MissingField(SIG_SHA256_ECDSA)),
            (
                doc(r#"{"filepath":"/fw","fileid":0,"certfile":"c"}"#),
                ParseError::MissingField("filesize"),
            ),
        ];
        for (raw, expected) in cases {
            assert_eq!(parse(raw.as_bytes()), Err(expected), "{raw}");
        }
    }

    #[test]
    fn invalid_values() {
        let zero = doc(&alloc::format!(
            r#"{{"filepath":"/fw","filesize":0,"fileid":0,"certfile":"c","sig-sha256-ecdsa":"{SIG}"}}"#
        ));
        assert_eq!(
            parse(zero.as_bytes()),
            Err(ParseError::InvalidValue("filesize"))
        );
        let huge = doc(&alloc::format!(
            r#"{{"filepath":"/fw","filesize":4194304,"fileid":0,"certfile":"c","sig-sha256-ecdsa":"{SIG}"}}"#
        ));
        assert_eq!(
            parse(huge.as_bytes()),
            Err(ParseError::InvalidValue("filesize"))
        );
        let bad_sig = doc(&file(r#","sig-sha256-ecdsa":"not base64!""#));
        assert_eq!(
            parse(bad_sig.as_bytes()),
            Err(ParseError::InvalidValue(SIG_SHA256_ECDSA))
        );
        assert_eq!(parse(b"{\"execution\":"), Err(ParseError::Malformed));
        assert_eq!(
            parse(br#"{"execution":{"jobId":7}}"#),
            Err(ParseError::Malformed)
        );
    }

    #[test]
    fn unsupported_version() {
        let raw = r#"{"execution":{"jobId":"j","jobDocument":{"afr_ota":{"version":2}}}}"#;
        assert_eq!(parse(raw.as_bytes()), Err(ParseError::UnsupportedVersion));
    }

    #[test]
    fn rsa_signature_is_recognised() {
        let raw = doc(&file(r#","sig-sha256-rsa":"AAEC""#));
        let job = parse(raw.as_bytes()).unwrap();
        assert_eq!(job.signature_algorithm, SignatureAlgorithm::RsaSha256);
        assert_eq!(job.signature, [0, 1, 2]);
    }

    #[test]
    fn self_test_details() {
        let raw = alloc::format!(
            r#"{{"execution":{{"jobId":"AFR_OTA-9","statusDetails":{{"self_test":"ready","updatedBy":"0x01000003"}},"jobDocument":{{"afr_ota":{{"streamname":"s-9","files":[{}]}}}}}}}}"#,
            signed_file()
        );
        let job = parse(raw.as_bytes()).unwrap();
        assert_eq!(job.self_test, Some(SelfTestStep::Ready));
        assert_eq!(job.updated_by, Some(AppVersion::new(1, 0, 3)));
    }

    #[test]
    fn explicit_block_size() {
        let raw = doc(&file(&alloc::format!(
            r#","blocksize":256,"sig-sha256-ecdsa":"{SIG}""#
        )));
        let job = parse_job_message(raw.as_bytes(), 1024).unwrap().unwrap();
        assert_eq!(job.block_size, 256);
        assert_eq!(job.block_count(), 16);
    }
}

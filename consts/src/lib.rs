#![no_std]

/// Base two logarithm of the size of a firmware block.
/// Blocks are the unit of transfer and of bookkeeping in the block bitmap.
#[cfg(not(feature = "large-blocks"))]
pub const LOG2_FILE_BLOCK_SIZE: u32 = 10;
#[cfg(feature = "large-blocks")]
pub const LOG2_FILE_BLOCK_SIZE: u32 = 12;

/// Size in bytes of a firmware block.
/// Every block but the last one of an image carries exactly this many bytes.
pub const FILE_BLOCK_SIZE: usize = 1 << LOG2_FILE_BLOCK_SIZE;

/// Size in bytes of the bitmap of received blocks.
/// 128 bytes track 1024 blocks, i.e. 1 MiB images with 1 KiB blocks.
pub const MAX_BLOCK_BITMAP_SIZE: usize = 128;

/// Maximum number of blocks in one image.
pub const MAX_BLOCKS: usize = MAX_BLOCK_BITMAP_SIZE * 8;

/// Headroom on top of a block payload for the stream message framing.
pub const STREAM_MSG_OVERHEAD: usize = 32;

/// Maximum size of a message handed from the transport to the agent task.
/// Job documents and stream blocks both have to fit.
pub const MAX_MSG_SIZE: usize = FILE_BLOCK_SIZE + STREAM_MSG_OVERHEAD;

/// Depth of the agent work queue.
/// Messages arriving while the queue is full are dropped and counted.
pub const MSG_QUEUE_DEPTH: usize = 4;

/// Number of times a single block is requested again before the job fails.
pub const MAX_BLOCK_RETRIES: u8 = 3;

/// Maximum number of blocks asked for in one stream request.
pub const REQUEST_WINDOW: u32 = 8;

/// Time to wait for stream data before asking for missing blocks again.
pub const FILE_REQUEST_WAIT_MS: u64 = 10_000;

/// Time to wait for the response to a job request.
pub const JOB_REQUEST_WAIT_MS: u64 = 10_000;

/// Number of job requests sent before the agent returns to idle.
pub const MAX_JOB_REQUEST_ATTEMPTS: u8 = 3;

/// Window after activation in which the new image must confirm itself.
/// Past this deadline the image is rolled back and the device reset.
pub const SELF_TEST_WAIT_MS: u64 = 16_000;

/// Number of attempts for a publish before the transport error is reported.
pub const MAX_PUBLISH_RETRIES: u8 = 3;

/// Delay before the first publish retry, doubled on every following attempt.
pub const PUBLISH_RETRY_DELAY_MS: u32 = 1_000;

/// Upper bound on the publish retry delay.
pub const PUBLISH_RETRY_MAX_DELAY_MS: u32 = 8_000;

/// Number of activation attempts before the job is declared failed.
pub const MAX_ACTIVATION_ATTEMPTS: u8 = 3;

/// Progress is reported to the job service once every this many blocks.
pub const UPDATE_STATUS_FREQUENCY: u32 = 64;

/// Maximum length of the thing name used in topics.
pub const MAX_THING_NAME_LEN: usize = 64;

/// Maximum length of a job identifier.
pub const MAX_JOB_ID_LEN: usize = 64;

/// Maximum length of a stream name.
pub const MAX_STREAM_NAME_LEN: usize = 64;

/// Maximum length of an MQTT topic built by the agent.
pub const MAX_TOPIC_LEN: usize = 192;

/// Client token carried by stream requests.
pub const STREAM_CLIENT_TOKEN: &str = "rdy";

/// Job document key of an ECDSA P-256 signature over the SHA-256 of the image.
pub const SIG_SHA256_ECDSA: &str = "sig-sha256-ecdsa";

/// Job document key of an RSA signature over the SHA-1 of the image.
pub const SIG_SHA1_RSA: &str = "sig-sha1-rsa";

/// Job document key of an RSA signature over the SHA-256 of the image.
pub const SIG_SHA256_RSA: &str = "sig-sha256-rsa";

/// Job document format understood by the agent.
pub const JOB_DOC_VERSION: u32 = 1;

//! Legacy header/packed-body message encoding.
//!
//! Everything except binary payloads travels in string headers. A hash
//! message lists its algorithms in `hash-algo` (comma-joined, ordered) and
//! concatenates the digests in the same order in the body; each digest's
//! length comes from the static length table, so the body carries no framing.

use std::collections::BTreeMap;

use super::{decode_id, encode_id, headers, Codec, Generation};
use crate::algorithm::{expected_length, Algorithm};
use crate::broker::{Destination, Message, Publisher};
use crate::error::{BrokerError, CodecError};
use crate::types::{ImagePath, LoadJob, PersistenceUpdate, UpdateKind};

const COMMAND_LOAD: &str = "load";
const COMMAND_RECREATE_THUMBNAIL: &str = "recreate-thumbnail";

/// Accumulates digests for one (`anchor`, `path`) and sends them as a single
/// packed message.
///
/// ```rust,ignore
/// let mut builder = HashMessageBuilder::new("photos", "a.jpg");
/// builder.add_hash("SHA-256", &sha256)?.add_hash("phash", &phash)?;
/// builder.send(publisher.as_ref(), &destination).await?;
/// ```
#[derive(Debug, Clone)]
pub struct HashMessageBuilder {
    anchor: String,
    relative_path: String,
    algorithms: Vec<&'static str>,
    body: Vec<u8>,
}

impl HashMessageBuilder {
    pub fn new(anchor: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            anchor: anchor.into(),
            relative_path: relative_path.into(),
            algorithms: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a digest, validating it against the length table.
    pub fn add_hash(&mut self, algorithm: &str, digest: &[u8]) -> Result<&mut Self, CodecError> {
        if algorithm.trim().is_empty() {
            return Err(CodecError::MissingArgument("algorithm"));
        }
        if digest.is_empty() {
            return Err(CodecError::MissingArgument("digest"));
        }
        let alg = Algorithm::from_name(algorithm)
            .ok_or_else(|| CodecError::UnsupportedAlgorithm(algorithm.to_string()))?;
        if digest.len() != alg.digest_len() {
            return Err(CodecError::InvalidDigestLength {
                algorithm: alg.name().to_string(),
                expected: alg.digest_len(),
                actual: digest.len(),
            });
        }

        self.algorithms.push(alg.name());
        self.body.extend_from_slice(digest);
        Ok(self)
    }

    /// Current, unsent `hash-algo` header value.
    pub fn header(&self) -> String {
        self.algorithms.join(",")
    }

    /// Current, unsent body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_empty(&self) -> bool {
        self.algorithms.is_empty()
    }

    /// Message for the current buffer contents.
    pub fn to_message(&self) -> Message {
        Message::new(self.body.clone())
            .with_header(headers::ANCHOR, self.anchor.as_str())
            .with_header(headers::PATH, self.relative_path.as_str())
            .with_header(headers::HASH_ALGO, self.header())
    }

    /// Publish the buffer as one message, then reset to empty.
    ///
    /// The buffer is kept when publishing fails.
    pub async fn send(
        &mut self,
        publisher: &dyn Publisher,
        destination: &Destination,
    ) -> Result<(), BrokerError> {
        publisher.publish(destination, self.to_message()).await?;
        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        self.algorithms.clear();
        self.body.clear();
    }
}

/// A decoded packed hash message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashMessage {
    pub anchor: String,
    pub relative_path: String,
    /// Digests in header order
    pub digests: Vec<(String, Vec<u8>)>,
}

/// Split a packed hash message back into its digests.
pub fn decode_hash_message(message: &Message) -> Result<HashMessage, CodecError> {
    let anchor = required(message, headers::ANCHOR)?;
    let relative_path = required(message, headers::PATH)?;
    let algorithms = split_list(required(message, headers::HASH_ALGO)?);

    let mut lengths = Vec::with_capacity(algorithms.len());
    for name in &algorithms {
        let len = expected_length(name)
            .ok_or_else(|| CodecError::UnsupportedAlgorithm(name.clone()))?;
        lengths.push(len);
    }

    let expected: usize = lengths.iter().sum();
    if message.body.len() != expected {
        return Err(CodecError::BodyLength {
            expected,
            actual: message.body.len(),
        });
    }

    let mut offset = 0;
    let digests = algorithms
        .into_iter()
        .zip(lengths)
        .map(|(name, len)| {
            let digest = message.body[offset..offset + len].to_vec();
            offset += len;
            (name, digest)
        })
        .collect();

    Ok(HashMessage {
        anchor: anchor.to_string(),
        relative_path: relative_path.to_string(),
        digests,
    })
}

fn required<'a>(message: &'a Message, key: &'static str) -> Result<&'a str, CodecError> {
    message.header(key).ok_or(CodecError::MissingHeader(key))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(message: &Message, key: &'static str) -> Result<bool, CodecError> {
    match message.header(key) {
        None | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(other) => Err(CodecError::InvalidHeader {
            key,
            value: other.to_string(),
        }),
    }
}

/// Codec for the header/packed-body generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyCodec;

impl Codec for LegacyCodec {
    fn generation(&self) -> Generation {
        Generation::Legacy
    }

    fn encode_job(&self, job: &LoadJob) -> Result<Message, CodecError> {
        let command = if job.recreate_thumbnail_only {
            COMMAND_RECREATE_THUMBNAIL
        } else {
            COMMAND_LOAD
        };
        Ok(Message::new(encode_id(job.image_id).to_vec())
            .with_header(headers::ANCHOR, job.anchor.as_str())
            .with_header(headers::PATH, job.relative_path.as_str())
            .with_header(headers::HASH_ALGO, job.missing_hash_algorithms.join(","))
            .with_header(
                headers::CUSTOM_HASH_ALGO,
                job.missing_custom_hash_algorithms.join(","),
            )
            .with_header(
                headers::THUMBNAIL_FOUND,
                (!job.generate_thumbnail).to_string(),
            )
            .with_header(headers::LOADER_COMMAND, command))
    }

    fn decode_job(&self, message: &Message) -> Result<LoadJob, CodecError> {
        let recreate_thumbnail_only = match message.header(headers::LOADER_COMMAND) {
            None | Some(COMMAND_LOAD) => false,
            Some(COMMAND_RECREATE_THUMBNAIL) => true,
            Some(other) => {
                return Err(CodecError::InvalidHeader {
                    key: headers::LOADER_COMMAND,
                    value: other.to_string(),
                })
            }
        };
        // Older producers omit the header when no thumbnail exists.
        let thumbnail_found = parse_bool(message, headers::THUMBNAIL_FOUND)?;

        Ok(LoadJob {
            anchor: required(message, headers::ANCHOR)?.to_string(),
            relative_path: required(message, headers::PATH)?.to_string(),
            image_id: decode_id(&message.body)?,
            missing_hash_algorithms: split_list(message.header(headers::HASH_ALGO).unwrap_or("")),
            missing_custom_hash_algorithms: split_list(
                message.header(headers::CUSTOM_HASH_ALGO).unwrap_or(""),
            ),
            generate_thumbnail: !thumbnail_found,
            recreate_thumbnail_only,
        })
    }

    fn encode_update(&self, update: &PersistenceUpdate) -> Result<Message, CodecError> {
        match &update.kind {
            UpdateKind::Hashes { digests } => {
                let mut builder =
                    HashMessageBuilder::new(update.anchor.as_str(), update.relative_path.as_str());
                for (algorithm, digest) in digests {
                    builder.add_hash(algorithm, digest)?;
                }
                Ok(builder.to_message())
            }
            UpdateKind::Thumbnail { max_dimension } => Ok(Message::default()
                .with_header(headers::ANCHOR, update.anchor.as_str())
                .with_header(headers::PATH, update.relative_path.as_str())
                .with_header(headers::THUMBNAIL_SIZE, max_dimension.to_string())),
        }
    }

    fn decode_update(&self, message: &Message) -> Result<PersistenceUpdate, CodecError> {
        if let Some(size) = message.header(headers::THUMBNAIL_SIZE) {
            let max_dimension = size.parse().map_err(|_| CodecError::InvalidHeader {
                key: headers::THUMBNAIL_SIZE,
                value: size.to_string(),
            })?;
            return Ok(PersistenceUpdate {
                anchor: required(message, headers::ANCHOR)?.to_string(),
                relative_path: required(message, headers::PATH)?.to_string(),
                kind: UpdateKind::Thumbnail { max_dimension },
            });
        }

        let decoded = decode_hash_message(message)?;
        Ok(PersistenceUpdate {
            anchor: decoded.anchor,
            relative_path: decoded.relative_path,
            kind: UpdateKind::Hashes {
                digests: decoded.digests.into_iter().collect::<BTreeMap<_, _>>(),
            },
        })
    }

    fn encode_path(&self, path: &ImagePath) -> Result<Message, CodecError> {
        Ok(Message::default()
            .with_header(headers::ANCHOR, path.anchor.as_str())
            .with_header(headers::PATH, path.relative_path.as_str()))
    }

    fn decode_path(&self, message: &Message) -> Result<ImagePath, CodecError> {
        Ok(ImagePath {
            anchor: required(message, headers::ANCHOR)?.to_string(),
            relative_path: required(message, headers::PATH)?.to_string(),
        })
    }
}

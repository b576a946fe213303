//! Pipeline configuration
//!
//! Everything is read once at startup, from `.env`, the environment and CLI
//! flags, into a [`PipelineConfig`] that is passed by reference into every
//! stage constructor.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use thiserror::Error;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default queue name.
pub const DEFAULT_QUEUE: &str = "s3-events";

/// Largest number of messages one SQS receive may return.
pub const MAX_RECEIVE_MESSAGES: usize = 10;

/// Longest SQS long-poll wait in seconds.
pub const MAX_WAIT_TIME_SECS: u32 = 20;

/// Default row batch size of the value sink.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default batch size of the error sink.
pub const DEFAULT_ERROR_BATCH_SIZE: usize = 100;

/// Default capacity of the channels between stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

/// Upper bound on the lines sampled for charset detection.
pub const MAX_ENCODING_SAMPLE_LINES: usize = 10;

/// Default Kafka delivery timeout in milliseconds.
pub const DEFAULT_KAFKA_MESSAGE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{setting} must be at least 1")]
    Zero { setting: &'static str },

    #[error("{setting} must be between {min} and {max}, got {value}")]
    OutOfRange {
        setting: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{setting} must not be empty")]
    Empty { setting: &'static str },

    #[error("invalid delimiter {0:?}: expected a single ASCII character or \\t")]
    Delimiter(String),
}

/// Whether a file with failed lines is still acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge only when every data line was written.
    #[default]
    Strict,
    /// Acknowledge once every parsed row was written; failed lines are reported
    /// but do not hold the notification back.
    AllowPartial,
}

/// Settings shared by every stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Queue name or URL
    pub queue: String,
    pub max_messages: usize,
    pub wait_time_secs: u32,
    /// Keep polling until an empty receive
    pub drain: bool,
    pub value_topic: String,
    pub error_topic: String,
    pub delimiter: u8,
    pub convert_to_utf8: bool,
    pub encoding_sample_lines: usize,
    pub batch_size: usize,
    pub error_batch_size: usize,
    pub channel_capacity: usize,
    pub ack_policy: AckPolicy,
    /// Directory for downloaded files; the system temp dir when unset
    pub temp_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_messages: MAX_RECEIVE_MESSAGES,
            wait_time_secs: 0,
            drain: false,
            value_topic: "csv-values".to_string(),
            error_topic: "csv-errors".to_string(),
            delimiter: b',',
            convert_to_utf8: true,
            encoding_sample_lines: MAX_ENCODING_SAMPLE_LINES,
            batch_size: DEFAULT_BATCH_SIZE,
            error_batch_size: DEFAULT_ERROR_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            ack_policy: AckPolicy::Strict,
            temp_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (setting, value) in [
            ("SQS_QUEUE", &self.queue),
            ("KAFKA_VALUE_TOPIC", &self.value_topic),
            ("KAFKA_ERROR_TOPIC", &self.error_topic),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty { setting });
            }
        }

        for (setting, value) in [
            ("BATCH_SIZE", self.batch_size),
            ("ERROR_BATCH_SIZE", self.error_batch_size),
            ("CHANNEL_CAPACITY", self.channel_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { setting });
            }
        }

        check_range("SQS_MAX_MESSAGES", self.max_messages as u64, 1, MAX_RECEIVE_MESSAGES as u64)?;
        check_range("SQS_WAIT_TIME_SECS", u64::from(self.wait_time_secs), 0, u64::from(MAX_WAIT_TIME_SECS))?;
        check_range(
            "ENCODING_SAMPLE_LINES",
            self.encoding_sample_lines as u64,
            1,
            MAX_ENCODING_SAMPLE_LINES as u64,
        )?;

        if !self.delimiter.is_ascii() || self.delimiter == b'\n' || self.delimiter == b'\r' {
            return Err(ConfigError::Delimiter(char::from(self.delimiter).to_string()));
        }

        Ok(())
    }
}

fn check_range(setting: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            setting,
            value,
            min,
            max,
        })
    }
}

/// Parses a delimiter setting: one ASCII character, or `\t` / `tab`.
pub fn parse_delimiter(raw: &str) -> Result<u8, ConfigError> {
    match raw {
        "\\t" | "tab" | "\t" => Ok(b'\t'),
        _ => {
            let mut chars = raw.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() && c != '\n' && c != '\r' => Ok(c as u8),
                _ => Err(ConfigError::Delimiter(raw.to_string())),
            }
        },
    }
}

/// Kafka connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    pub brokers: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub message_timeout: Duration,
}

impl KafkaSettings {
    /// SASL credentials, when both halves are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user, password))
            },
            _ => None,
        }
    }
}

/// Optional overrides for the AWS SDK loader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwsSettings {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

/// Command-line and environment options of the ingest process
#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// SQS queue name or URL
    #[arg(long, env = "SQS_QUEUE", default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Messages per SQS receive (1-10)
    #[arg(long, env = "SQS_MAX_MESSAGES", default_value_t = MAX_RECEIVE_MESSAGES)]
    pub max_messages: usize,

    /// SQS long-poll wait in seconds (0-20)
    #[arg(long, env = "SQS_WAIT_TIME_SECS", default_value_t = 0)]
    pub wait_time_secs: u32,

    /// Keep receiving until the queue returns nothing
    #[arg(long, env = "SQS_DRAIN", default_value_t = false, action = clap::ArgAction::Set)]
    pub drain: bool,

    /// Topic rows are written to
    #[arg(long, env = "KAFKA_VALUE_TOPIC")]
    pub value_topic: String,

    /// Topic errors are written to
    #[arg(long, env = "KAFKA_ERROR_TOPIC")]
    pub error_topic: String,

    /// Kafka bootstrap servers
    #[arg(long, env = "KAFKA_BROKERS")]
    pub brokers: String,

    #[arg(long, env = "KAFKA_USERNAME")]
    pub kafka_username: Option<String>,

    #[arg(long, env = "KAFKA_PASSWORD", hide_env_values = true)]
    pub kafka_password: Option<String>,

    /// Kafka delivery timeout in milliseconds
    #[arg(long, env = "KAFKA_MESSAGE_TIMEOUT_MS", default_value_t = DEFAULT_KAFKA_MESSAGE_TIMEOUT_MS)]
    pub kafka_message_timeout_ms: u64,

    /// CSV field delimiter
    #[arg(long, env = "DEFAULT_CSV_SEPARATOR", default_value = ",")]
    pub delimiter: String,

    /// Transcode non-UTF-8 files before parsing
    #[arg(long, env = "CONVERT_TO_UTF8", default_value_t = true, action = clap::ArgAction::Set)]
    pub convert_to_utf8: bool,

    /// Lines sampled for charset detection (1-10)
    #[arg(long, env = "ENCODING_SAMPLE_LINES", default_value_t = MAX_ENCODING_SAMPLE_LINES)]
    pub encoding_sample_lines: usize,

    #[arg(long, env = "BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    #[arg(long, env = "ERROR_BATCH_SIZE", default_value_t = DEFAULT_ERROR_BATCH_SIZE)]
    pub error_batch_size: usize,

    #[arg(long, env = "CHANNEL_CAPACITY", default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,

    /// Acknowledge files even when some of their lines failed
    #[arg(long, env = "ACK_PARTIAL_FILES", default_value_t = false, action = clap::ArgAction::Set)]
    pub ack_partial_files: bool,

    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    /// Custom AWS endpoint, e.g. LocalStack
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    pub aws_endpoint_url: Option<String>,

    /// Directory for downloaded files
    #[arg(long, env = "TMPDIR_OVERRIDE")]
    pub temp_dir: Option<PathBuf>,
}

impl IngestArgs {
    /// Builds and validates the pipeline configuration.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let config = PipelineConfig {
            queue: self.queue.clone(),
            max_messages: self.max_messages,
            wait_time_secs: self.wait_time_secs,
            drain: self.drain,
            value_topic: self.value_topic.clone(),
            error_topic: self.error_topic.clone(),
            delimiter: parse_delimiter(&self.delimiter)?,
            convert_to_utf8: self.convert_to_utf8,
            encoding_sample_lines: self.encoding_sample_lines,
            batch_size: self.batch_size,
            error_batch_size: self.error_batch_size,
            channel_capacity: self.channel_capacity,
            ack_policy: if self.ack_partial_files {
                AckPolicy::AllowPartial
            } else {
                AckPolicy::Strict
            },
            temp_dir: self.temp_dir.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn kafka_settings(&self) -> Result<KafkaSettings, ConfigError> {
        if self.brokers.trim().is_empty() {
            return Err(ConfigError::Empty {
                setting: "KAFKA_BROKERS",
            });
        }
        Ok(KafkaSettings {
            brokers: self.brokers.clone(),
            username: self.kafka_username.clone(),
            password: self.kafka_password.clone(),
            message_timeout: Duration::from_millis(self.kafka_message_timeout_ms),
        })
    }

    pub fn aws_settings(&self) -> AwsSettings {
        AwsSettings {
            region: self.aws_region.clone(),
            endpoint_url: self.aws_endpoint_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        args: IngestArgs,
    }

    fn parse(extra: &[&str]) -> IngestArgs {
        let mut argv = vec![
            "csvpipe-ingest",
            "--value-topic",
            "values",
            "--error-topic",
            "errors",
            "--brokers",
            "localhost:9092",
        ];
        argv.extend_from_slice(extra);
        TestCli::try_parse_from(argv).unwrap().args
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = PipelineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                setting: "BATCH_SIZE"
            })
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range_sqs_limits() {
        let config = PipelineConfig {
            max_messages: 11,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                setting: "SQS_MAX_MESSAGES",
                ..
            })
        ));

        let config = PipelineConfig {
            wait_time_secs: 21,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_topic() {
        let config = PipelineConfig {
            error_topic: " ".into(),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Empty {
                setting: "KAFKA_ERROR_TOPIC"
            })
        );
    }

    #[test]
    fn test_parse_delimiter() {
        assert_eq!(parse_delimiter(","), Ok(b','));
        assert_eq!(parse_delimiter(";"), Ok(b';'));
        assert_eq!(parse_delimiter("\\t"), Ok(b'\t'));
        assert_eq!(parse_delimiter("tab"), Ok(b'\t'));
        assert!(parse_delimiter("").is_err());
        assert!(parse_delimiter(";;").is_err());
        assert!(parse_delimiter("é").is_err());
    }

    #[test]
    fn test_args_build_config() {
        let args = parse(&["--delimiter", ";", "--batch-size", "25", "--ack-partial-files", "true"]);
        let config = args.pipeline_config().unwrap();

        assert_eq!(config.delimiter, b';');
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.ack_policy, AckPolicy::AllowPartial);
        assert_eq!(config.value_topic, "values");
        assert!(config.convert_to_utf8);
    }

    #[test]
    fn test_args_reject_bad_delimiter() {
        let args = parse(&["--delimiter", "ab"]);
        assert_eq!(
            args.pipeline_config(),
            Err(ConfigError::Delimiter("ab".into()))
        );
    }

    #[test]
    fn test_kafka_credentials_need_both_halves() {
        let args = parse(&["--kafka-username", "svc"]);
        let kafka = args.kafka_settings().unwrap();
        assert_eq!(kafka.credentials(), None);
        assert_eq!(kafka.message_timeout, Duration::from_secs(10));

        let args = parse(&["--kafka-username", "svc", "--kafka-password", "secret"]);
        assert_eq!(args.kafka_settings().unwrap().credentials(), Some(("svc", "secret")));
    }
}

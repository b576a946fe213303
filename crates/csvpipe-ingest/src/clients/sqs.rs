//! SQS-backed notification feed

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::Client;
use tracing::{debug, info, instrument};

use super::{FeedError, FeedMessage, NotificationFeed};

#[derive(Debug, Clone)]
pub struct SqsFeed {
    client: Client,
    queue_url: String,
    wait_time_secs: u32,
}

impl SqsFeed {
    /// Connects to `queue`, given either as a queue name or a queue URL.
    pub async fn connect(
        sdk_config: &SdkConfig,
        queue: &str,
        wait_time_secs: u32,
    ) -> Result<Self, FeedError> {
        let client = Client::new(sdk_config);

        let queue_url = if is_queue_url(queue) {
            queue.to_string()
        } else {
            let output = client
                .get_queue_url()
                .queue_name(queue)
                .send()
                .await
                .map_err(|e| FeedError::Unavailable {
                    queue: queue.to_string(),
                    reason: DisplayErrorContext(&e).to_string(),
                })?;
            output
                .queue_url()
                .map(str::to_string)
                .ok_or_else(|| FeedError::Unavailable {
                    queue: queue.to_string(),
                    reason: "no queue URL returned".to_string(),
                })?
        };

        info!(queue_url = %queue_url, "SQS feed ready");

        Ok(Self {
            client,
            queue_url,
            wait_time_secs,
        })
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

fn is_queue_url(queue: &str) -> bool {
    queue.starts_with("https://") || queue.starts_with("http://")
}

#[async_trait]
impl NotificationFeed for SqsFeed {
    #[instrument(skip(self), fields(queue_url = %self.queue_url))]
    async fn receive(&self, max: usize) -> Result<Vec<FeedMessage>, FeedError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(i32::try_from(max).unwrap_or(10))
            .wait_time_seconds(i32::try_from(self.wait_time_secs).unwrap_or(0))
            .send()
            .await
            .map_err(|e| FeedError::Unavailable {
                queue: self.queue_url.clone(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        let messages: Vec<FeedMessage> = output
            .messages()
            .iter()
            .filter_map(|message| {
                Some(FeedMessage {
                    body: message.body()?.to_string(),
                    receipt_handle: message.receipt_handle()?.to_string(),
                })
            })
            .collect();

        debug!(count = messages.len(), "received messages");
        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), FeedError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| FeedError::Delete {
                queue: self.queue_url.clone(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }
}

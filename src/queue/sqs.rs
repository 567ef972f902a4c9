use super::{EventSource, QueueError, QueuedEvent};
use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use std::time::Duration;

/// [`EventSource`] backed by an SQS queue using long polling.
#[derive(Clone)]
pub struct SqsEventSource {
    client: Client,
    queue_url: String,
}

impl SqsEventSource {
    pub fn new(config: &aws_config::SdkConfig, queue_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(config),
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl EventSource for SqsEventSource {
    async fn receive(&self, max: i32, wait: Duration) -> Result<Vec<QueuedEvent>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max)
            .wait_time_seconds(wait.as_secs().min(20) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|err| QueueError::Receive(DisplayErrorContext(&err).to_string()))?;

        let mut events = Vec::new();
        for message in output.messages() {
            let Some(receipt) = message.receipt_handle() else {
                log::warn!("sqs message {:?} has no receipt handle", message.message_id());
                continue;
            };
            let receive_count = message
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|count| count.parse().ok())
                .unwrap_or(1);

            events.push(QueuedEvent {
                body: message.body().unwrap_or_default().to_string(),
                receipt: receipt.to_string(),
                receive_count,
            });
        }

        Ok(events)
    }

    async fn acknowledge(&self, event: &QueuedEvent) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&event.receipt)
            .send()
            .await
            .map_err(|err| QueueError::Acknowledge(DisplayErrorContext(&err).to_string()))?;
        Ok(())
    }
}

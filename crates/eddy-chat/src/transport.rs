//! Server-push transport abstraction

use std::{pin::Pin, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use eddy_wire::{ApiClient, RawFrame};
use futures::StreamExt;
use reqwest_eventsource::Event;
use tokio_stream::Stream;

use crate::error::Result;

/// Reconnect configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// What a transport reports while connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// The connection is established
    Open,
    /// One server frame
    Frame(RawFrame),
    /// The connection failed; the stream ends after this
    Error(String),
    /// The server refused the connection (bad token, unknown conversation);
    /// reconnecting cannot help
    Rejected(String),
}

/// A stream of transport signals for one connection attempt
pub type SignalStream = Pin<Box<dyn Stream<Item = TransportSignal> + Send>>;

/// Opens one push connection per call. Reconnection is the caller's job.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn connect(&self, conversation_id: &str) -> Result<SignalStream>;
}

/// Server-sent events over HTTP
pub struct SseTransport {
    client: ApiClient,
}

impl SseTransport {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventTransport for SseTransport {
    async fn connect(&self, conversation_id: &str) -> Result<SignalStream> {
        let mut event_source = self.client.event_source(conversation_id)?;

        Ok(Box::pin(stream! {
            while let Some(event) = event_source.next().await {
                match event {
                    Ok(Event::Open) => yield TransportSignal::Open,
                    Ok(Event::Message(message)) => {
                        yield TransportSignal::Frame(RawFrame::new(message.event, message.data));
                    }
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, _))
                        if !eddy_wire::Error::api(status.as_u16(), "").is_retryable() =>
                    {
                        event_source.close();
                        yield TransportSignal::Rejected(format!("server refused connection ({})", status));
                        break;
                    }
                    Err(e) => {
                        event_source.close();
                        yield TransportSignal::Error(e.to_string());
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let config = RetryConfig::default();
        let secs: Vec<u64> = (0..7).map(|a| config.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_respects_custom_cap() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(0).as_millis(), 100);
        assert_eq!(config.delay_for_attempt(1).as_millis(), 200);
        assert_eq!(config.delay_for_attempt(5).as_millis(), 250);
    }
}

//! Channel adapters: the only components that speak to providers.
//!
//! An adapter performs exactly one external send attempt per call and
//! classifies every provider error as transient or permanent. Retry
//! policy stays with the scheduler so attempt counting has one owner.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use drip_core::{Channel, RenderedMessage, SendFailure};

/// Opaque transport to the actual provider. Everything beyond this seam
/// (wire format, auth, endpoints) is out of scope.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Hand one message to the provider, returning its message id.
    async fn submit(
        &self,
        channel: Channel,
        to: &str,
        message: &RenderedMessage,
    ) -> Result<String, SendFailure>;
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// One send attempt. No retries in here.
    async fn send(&self, to: &str, message: &RenderedMessage) -> Result<String, SendFailure>;
}

pub struct EmailAdapter {
    provider: std::sync::Arc<dyn ProviderClient>,
}

impl EmailAdapter {
    pub fn new(provider: std::sync::Arc<dyn ProviderClient>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, to: &str, message: &RenderedMessage) -> Result<String, SendFailure> {
        if !looks_like_email(to) {
            return Err(SendFailure::permanent(format!("invalid email address: {to}")));
        }
        self.provider.submit(Channel::Email, to, message).await
    }
}

pub struct SmsAdapter {
    provider: std::sync::Arc<dyn ProviderClient>,
}

impl SmsAdapter {
    pub fn new(provider: std::sync::Arc<dyn ProviderClient>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, to: &str, message: &RenderedMessage) -> Result<String, SendFailure> {
        if !looks_like_phone(to) {
            return Err(SendFailure::permanent(format!("invalid phone number: {to}")));
        }
        self.provider.submit(Channel::Sms, to, message).await
    }
}

pub struct PushAdapter {
    provider: std::sync::Arc<dyn ProviderClient>,
}

impl PushAdapter {
    pub fn new(provider: std::sync::Arc<dyn ProviderClient>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, to: &str, message: &RenderedMessage) -> Result<String, SendFailure> {
        if to.trim().is_empty() {
            return Err(SendFailure::permanent("empty device token"));
        }
        self.provider.submit(Channel::Push, to, message).await
    }
}

fn looks_like_email(addr: &str) -> bool {
    match addr.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

fn looks_like_phone(addr: &str) -> bool {
    let digits = addr.strip_prefix('+').unwrap_or(addr);
    digits.len() >= 7 && digits.chars().all(|c| c.is_ascii_digit())
}

/// Provider stub that only logs; used by the binary when no real
/// provider is wired up.
pub struct LogProvider;

#[async_trait]
impl ProviderClient for LogProvider {
    async fn submit(
        &self,
        channel: Channel,
        to: &str,
        message: &RenderedMessage,
    ) -> Result<String, SendFailure> {
        let provider_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!(
            channel = channel.as_str(),
            to,
            sender = %message.sender,
            provider_id = %provider_id,
            "message handed to provider"
        );
        Ok(provider_id)
    }
}

/// Scriptable provider double for tests: pops a queued outcome per call,
/// succeeding once the script runs out.
#[derive(Default)]
pub struct MockProvider {
    outcomes: Mutex<VecDeque<SendFailure>>,
    submitted: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `failure` to be returned before any successes.
    pub fn fail_next(&self, failure: SendFailure) {
        self.outcomes
            .lock()
            .expect("mock outcomes lock")
            .push_back(failure);
    }

    /// Successful submissions so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn submit(
        &self,
        _channel: Channel,
        _to: &str,
        _message: &RenderedMessage,
    ) -> Result<String, SendFailure> {
        let scripted = self.outcomes.lock().expect("mock outcomes lock").pop_front();
        if let Some(failure) = scripted {
            return Err(failure);
        }
        let n = self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mock-{n}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn message() -> RenderedMessage {
        RenderedMessage {
            subject: Some("hello".into()),
            body: "body".into(),
            sender: "us@example.com".into(),
        }
    }

    #[tokio::test]
    async fn email_adapter_rejects_bad_addresses_without_a_provider_call() {
        let provider = Arc::new(MockProvider::new());
        let adapter = EmailAdapter::new(provider.clone());

        let err = adapter.send("not-an-address", &message()).await.unwrap_err();
        assert_eq!(err.kind, drip_core::FailureKind::Permanent);
        assert_eq!(provider.submitted(), 0);

        adapter.send("a@example.com", &message()).await.unwrap();
        assert_eq!(provider.submitted(), 1);
    }

    #[tokio::test]
    async fn sms_adapter_validates_phone_numbers() {
        let provider = Arc::new(MockProvider::new());
        let adapter = SmsAdapter::new(provider.clone());

        assert!(adapter.send("+15551234567", &message()).await.is_ok());
        assert!(adapter.send("555-ABCD", &message()).await.is_err());
    }

    #[tokio::test]
    async fn mock_provider_scripts_failures_first() {
        let provider = MockProvider::new();
        provider.fail_next(SendFailure::transient("burp"));
        assert!(
            provider
                .submit(Channel::Email, "a@example.com", &message())
                .await
                .is_err()
        );
        assert!(
            provider
                .submit(Channel::Email, "a@example.com", &message())
                .await
                .is_ok()
        );
    }
}

//! In-memory capability doubles shared by the unit tests.

use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldArray, FieldTable};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::GatekeeperConfig;
use crate::retry::{DEATH_HEADER, RETRY_COUNT_HEADER};
use crate::services::{
    ApplicationStore, Cache, CacheError, GameRpc, MailError, Mailer, RequestPatch, RpcError,
    StoreError,
};
use crate::task::Task;

/// Config used across handler tests: broadcast to three moderators with a
/// quorum of two, test environment, fixed passphrase and front-end base.
pub(crate) fn test_config() -> Arc<GatekeeperConfig> {
    let config: GatekeeperConfig = toml::from_str(
        r#"
            environment = "test"
            passphrase = "hunter2"
            frontend_base_url = "https://gate.example.com/"

            [dispatch]
            strategy = "Broadcast"
            ops = ["m1@x", "m2@x", "m3@x"]
            min_required_receiver = 2
        "#,
    )
    .expect("test config parses");
    Arc::new(config)
}

/// Headers as the broker would present them after `prior_count` republishes,
/// with the head of the death trace carrying `original_expiration`.
pub(crate) fn retry_headers_with_death(prior_count: i32, original_expiration: &str) -> FieldTable {
    let mut death = FieldTable::default();
    death.insert(
        "original-expiration".into(),
        AMQPValue::LongString(original_expiration.into()),
    );

    let mut headers = FieldTable::default();
    headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(prior_count));
    headers.insert(
        DEATH_HEADER.into(),
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
    );
    headers
}

/// Records every patch applied to the document store.
#[derive(Default)]
pub(crate) struct RecordingStore {
    patches: Mutex<Vec<(String, RequestPatch)>>,
}

impl RecordingStore {
    pub(crate) fn patches(&self) -> Vec<(String, RequestPatch)> {
        self.patches.lock().expect("store mutex").clone()
    }
}

#[async_trait]
impl ApplicationStore for RecordingStore {
    async fn update_request(&self, id: &str, patch: RequestPatch) -> Result<(), StoreError> {
        self.patches
            .lock()
            .expect("store mutex")
            .push((id.to_string(), patch));
        Ok(())
    }
}

/// Counts cache refreshes; can be switched to fail every call.
#[derive(Default)]
pub(crate) struct RecordingCache {
    all_requests: AtomicUsize,
    real_time: AtomicUsize,
    aggregate: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingCache {
    pub(crate) fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn all_requests_calls(&self) -> usize {
        self.all_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn real_time_calls(&self) -> usize {
        self.real_time.load(Ordering::SeqCst)
    }

    pub(crate) fn aggregate_calls(&self) -> usize {
        self.aggregate.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Operation("cache double failing".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Cache for RecordingCache {
    async fn update_all_requests(&self) -> Result<(), CacheError> {
        self.check()?;
        self.all_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_real_time_stats(&self, _task: &Task) -> Result<(), CacheError> {
        self.check()?;
        self.real_time.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_aggregate_stats(&self) -> Result<(), CacheError> {
        self.check()?;
        self.aggregate.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One captured outbound mail.
#[derive(Debug, Clone)]
pub(crate) struct SentMail {
    pub template: String,
    pub subject: String,
    pub recipient: String,
    pub link: Option<String>,
}

/// Captures outbound mail and rejects configured recipients.
#[derive(Default)]
pub(crate) struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
    rejected: Mutex<HashSet<String>>,
}

impl RecordingMailer {
    pub(crate) fn reject(&self, recipient: &str) {
        self.rejected
            .lock()
            .expect("mailer mutex")
            .insert(recipient.to_string());
    }

    pub(crate) fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().expect("mailer mutex").clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(
        &self,
        template: &str,
        substitutions: std::collections::HashMap<String, String>,
        subject: &str,
        recipient: &str,
    ) -> Result<(), MailError> {
        if self.rejected.lock().expect("mailer mutex").contains(recipient) {
            return Err(MailError::Delivery(format!("{recipient} unreachable")));
        }

        self.sent.lock().expect("mailer mutex").push(SentMail {
            template: template.to_string(),
            subject: subject.to_string(),
            recipient: recipient.to_string(),
            link: substitutions.get("link").cloned(),
        });
        Ok(())
    }
}

/// Game-RPC double that can be scripted to fail its next N commands.
#[derive(Default)]
pub(crate) struct ScriptedRpc {
    commands: Mutex<Vec<String>>,
    failures_left: AtomicUsize,
}

impl ScriptedRpc {
    pub(crate) fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("rpc mutex").clone()
    }
}

#[async_trait]
impl GameRpc for ScriptedRpc {
    async fn send_command(&self, command: &str) -> Result<String, RpcError> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(RpcError::Command("connection reset".to_string()));
        }

        self.commands
            .lock()
            .expect("rpc mutex")
            .push(command.to_string());
        Ok(String::new())
    }
}

//! Per-status task handlers.
//!
//! Each application status maps to one handler that orchestrates the side
//! effects for that transition: game-server commands, templated e-mails,
//! persisted-status updates, and cache refreshes. Handlers never touch the
//! broker; they return a [`Disposition`] and the engine, as the sole holder
//! of the delivery, acknowledges or republishes accordingly. That keeps each
//! delivery acknowledged at most once and keeps the handlers testable against
//! in-memory capability doubles.
//!
//! Handlers may run more than once for the same task (the broker redelivers
//! after a close, and the retry cycle replays them from scratch), so their
//! side effects are idempotent: whitelisting an already-whitelisted player is
//! a no-op on the game server, and document updates are plain field sets. The
//! one non-idempotent effect, the user-visible decision e-mail on approval,
//! is guarded by the first-attempt witness in the retry headers.

use lapin::types::FieldTable;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::GatekeeperConfig;
use crate::dispatch::OpDispatcher;
use crate::retry::{self, RetryDecision};
use crate::services::{ApplicationStore, Cache, GameRpc, Mailer, RequestPatch, RpcError};
use crate::task::{OnserverStatus, Status, Task};
use crate::token;

const APPROVE_TEMPLATE: &str = "templates/approve.html";
const DENY_TEMPLATE: &str = "templates/deny.html";
const CONFIRMATION_TEMPLATE: &str = "templates/confirmation.html";
const OPS_TEMPLATE: &str = "templates/ops.html";

/// What the engine should do with the delivery after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Positively acknowledge the delivery.
    Ack,

    /// Republish to the retry exchange, then acknowledge the original.
    Retry { delay_ms: u64, retry_count: i32 },

    /// Leave the delivery unacknowledged; the work queue's own TTL will
    /// eventually route it back through the retry exchange.
    Leave,
}

/// Handler bundle sharing the capability objects and configuration.
pub struct Handlers {
    config: Arc<GatekeeperConfig>,
    dispatcher: OpDispatcher,
    store: Arc<dyn ApplicationStore>,
    cache: Arc<dyn Cache>,
    mailer: Arc<dyn Mailer>,
    game_rpc: Option<Arc<dyn GameRpc>>,
}

impl Handlers {
    pub fn new(
        config: Arc<GatekeeperConfig>,
        dispatcher: OpDispatcher,
        store: Arc<dyn ApplicationStore>,
        cache: Arc<dyn Cache>,
        mailer: Arc<dyn Mailer>,
        game_rpc: Option<Arc<dyn GameRpc>>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            store,
            cache,
            mailer,
            game_rpc,
        }
    }

    /// A freshly submitted application: confirm receipt to the applicant and
    /// fan action e-mails out to moderators.
    ///
    /// When fewer than the configured quorum of moderators could be reached
    /// the delivery is left unacknowledged, with no manual republish; the
    /// work queue's 24-hour TTL is the only redelivery path. Assignees who
    /// did receive mail are persisted either way.
    pub async fn process_new_request(&self, task: &Task) -> Disposition {
        info!(
            username = %task.username,
            id = %task.id,
            kind = "new request",
            "Received new task"
        );

        self.email_confirmation(task).await;

        let quorum = self.config.dispatch.min_required_receiver;
        let (success_count, quorum_met) = self.email_to_ops(task).await;
        if !quorum_met {
            error!(
                id = %task.id,
                username = %task.username,
                success_count,
                quorum,
                "Failed to dispatch action emails to the required number of moderators"
            );
            return Disposition::Leave;
        }

        self.update_cache(task).await;
        Disposition::Ack
    }

    /// An approved application: whitelist the player, then notify them.
    ///
    /// The decision e-mail goes out only on the first delivery attempt; a
    /// replay after a broker-side retry must not duplicate it.
    pub async fn process_approval(&self, task: &Task, headers: Option<&FieldTable>) -> Disposition {
        info!(
            username = %task.username,
            id = %task.id,
            kind = "approval",
            "Received new task"
        );

        self.update_cache(task).await;

        let command = format!("whitelist add {}", task.username);
        if let Err(err) = self.issue_command(&command).await {
            warn!(
                username = %task.username,
                error = %err,
                "Unable to whitelist user at this moment. Will retry later"
            );
            return self.retry_or_give_up(headers, &command);
        }

        if retry::is_first_attempt(headers) {
            self.email_decision(task).await;
        }
        self.update_onserver_status(task, OnserverStatus::Whitelisted)
            .await;
        Disposition::Ack
    }

    /// A denied application: tell the applicant. Mail failures are logged and
    /// swallowed; the decision is already persisted upstream.
    pub async fn process_denial(&self, task: &Task) -> Disposition {
        info!(
            username = %task.username,
            id = %task.id,
            kind = "denial",
            "Received new task"
        );

        self.update_cache(task).await;
        self.email_decision(task).await;
        Disposition::Ack
    }

    /// A deactivated application: remove the player from the whitelist but
    /// allow future applications from the same user.
    pub async fn process_deactivate(
        &self,
        task: &Task,
        headers: Option<&FieldTable>,
    ) -> Disposition {
        info!(
            username = %task.username,
            id = %task.id,
            kind = "deactivate",
            "Received new task"
        );

        let command = format!("whitelist remove {}", task.username);
        if let Err(err) = self.issue_command(&command).await {
            warn!(
                username = %task.username,
                error = %err,
                "Unable to deactivate user on the game server at this moment. Will retry later"
            );
            return self.retry_or_give_up(headers, &command);
        }

        self.update_onserver_status(task, OnserverStatus::None).await;
        self.update_cache(task).await;
        Disposition::Ack
    }

    /// A banned user: ban on the game server and block future applications.
    ///
    /// Unlike the other RPC handlers, a failed ban still records the banned
    /// status and acknowledges the original delivery; the scheduled retry
    /// replays the whole handler later, which is tolerable because the ban
    /// command is idempotent on the game server.
    pub async fn process_ban(&self, task: &Task, headers: Option<&FieldTable>) -> Disposition {
        info!(
            username = %task.username,
            id = %task.id,
            kind = "ban",
            "Received new task"
        );

        let mut disposition = Disposition::Ack;
        let command = format!("ban {}", task.username);
        if let Err(err) = self.issue_command(&command).await {
            warn!(
                username = %task.username,
                error = %err,
                "Unable to ban user on the game server at this moment. Will retry later"
            );
            disposition = self.retry_or_give_up(headers, &command);
        }

        self.update_onserver_status(task, OnserverStatus::Banned).await;
        self.update_cache(task).await;
        disposition
    }

    /// Run the retry policy for a failed action and log a give-up.
    fn retry_or_give_up(&self, headers: Option<&FieldTable>, action: &str) -> Disposition {
        match retry::decide(headers) {
            RetryDecision::Republish {
                delay_ms,
                retry_count,
            } => {
                info!(action, retry_count, delay_ms, "Scheduling retry through the delay queue");
                Disposition::Retry {
                    delay_ms,
                    retry_count,
                }
            }
            RetryDecision::GiveUp => {
                error!(action, "Unable to perform this operation. Giving up on retries");
                Disposition::Ack
            }
        }
    }

    /// Best-effort cache refresh: the listing first, then real-time stats.
    async fn update_cache(&self, task: &Task) {
        if let Err(err) = self.cache.update_all_requests().await {
            warn!(error = %err, "Unable to refresh all requests in cache");
        }

        if let Err(err) = self.cache.update_real_time_stats(task).await {
            warn!(error = %err, "Unable to update stats in cache");
        }
    }

    /// Persist the on-server status field; failures are logged and the
    /// handler continues.
    async fn update_onserver_status(&self, task: &Task, status: OnserverStatus) {
        let patch = RequestPatch::with_onserver_status(status);
        if let Err(err) = self.store.update_request(&task.id, patch).await {
            error!(
                error = %err,
                id = %task.id,
                status = %status,
                "Unable to update onserver status"
            );
        }
    }

    /// Send the approve/deny decision e-mail to the applicant.
    async fn email_decision(&self, task: &Task) -> bool {
        let link = token::seal(&task.id, &self.config.passphrase);
        let (subject, template) = if task.status == Status::Approved {
            (self.config.email.approved_title.as_str(), APPROVE_TEMPLATE)
        } else {
            (self.config.email.denied_title.as_str(), DENY_TEMPLATE)
        };

        let substitutions = HashMap::from([("link".to_string(), link)]);
        match self
            .mailer
            .send(template, substitutions, subject, &task.email)
            .await
        {
            Ok(()) => {
                info!(recipient = %task.email, "Decision email sent");
                true
            }
            Err(err) => {
                error!(
                    recipient = %task.email,
                    error = %err,
                    id = %task.id,
                    "Failed to send decision email"
                );
                false
            }
        }
    }

    /// Send the submission confirmation with a status link.
    async fn email_confirmation(&self, task: &Task) -> bool {
        let request_token = token::seal(&task.id, &self.config.passphrase);
        let link = format!("{}status/{}", self.config.frontend_base_url, request_token);

        let substitutions = HashMap::from([("link".to_string(), link)]);
        match self
            .mailer
            .send(
                CONFIRMATION_TEMPLATE,
                substitutions,
                &self.config.email.confirmation_title,
                &task.email,
            )
            .await
        {
            Ok(()) => {
                info!(recipient = %task.email, "Confirmation email sent");
                true
            }
            Err(err) => {
                error!(
                    recipient = %task.email,
                    error = %err,
                    id = %task.id,
                    "Failed to send confirmation email"
                );
                false
            }
        }
    }

    /// Fan action e-mails out to the selected moderators.
    ///
    /// Moderators who received mail become the application's `assignees`;
    /// the list is persisted whenever it is non-empty, even below quorum, so
    /// the UI can show who already has the request in their inbox. Returns
    /// the success count and whether it met the configured quorum.
    async fn email_to_ops(&self, task: &Task) -> (usize, bool) {
        let subject = format!("[Action Required] Whitelist request from {}", task.username);
        let request_token = token::seal(&task.id, &self.config.passphrase);

        let mut assignees = Vec::new();
        for op in self.dispatcher.select() {
            let op_token = token::seal(&op, &self.config.passphrase);
            let link = format!(
                "{}action/{}?adm={}",
                self.config.frontend_base_url, request_token, op_token
            );

            let substitutions = HashMap::from([("link".to_string(), link)]);
            match self
                .mailer
                .send(OPS_TEMPLATE, substitutions, &subject, &op)
                .await
            {
                Ok(()) => {
                    info!(recipient = %op, id = %task.id, "Action email sent to moderator");
                    assignees.push(op);
                }
                Err(err) => {
                    error!(
                        recipient = %op,
                        error = %err,
                        id = %task.id,
                        "Failed to send action email to moderator"
                    );
                }
            }
        }

        let success_count = assignees.len();
        if !assignees.is_empty() {
            let patch = RequestPatch::with_assignees(assignees.clone());
            if let Err(err) = self.store.update_request(&task.id, patch).await {
                error!(
                    error = %err,
                    id = %task.id,
                    assignees = ?assignees,
                    "Unable to attach assignees to the application record"
                );
            }
        }

        (
            success_count,
            success_count >= self.config.dispatch.min_required_receiver,
        )
    }

    /// Issue a console command against the game server.
    async fn issue_command(&self, command: &str) -> Result<(), RpcError> {
        let rpc = self.game_rpc.as_ref().ok_or(RpcError::Disabled)?;
        rpc.send_command(command).await?;
        info!(command, "Command has been issued on the game server");
        Ok(())
    }
}

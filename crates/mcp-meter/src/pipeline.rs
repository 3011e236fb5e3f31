//! Gateway orchestrator: the per-request metered state machine.
//!
//! ```text
//! RECEIVED -> AUTHENTICATED -> SERVER_RESOLVED -> COMPLIANCE_CHECKED -> PRICED
//!          -> ADMITTED -> DISPATCHED -> BILLED -> LOGGED -> RESPONDED
//! ```
//!
//! Every stage before `DISPATCHED` may reject the request, and none of them
//! touch the wallet or the usage log. Once a request is admitted, dispatch,
//! billing and recording run in a spawned task so they complete even if the
//! caller goes away mid-flight. Billing and recording failures are logged as
//! alerts and never change what the caller receives.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;

use crate::backend::{DispatchFailure, Dispatcher, MeterStore, UpstreamResponse};
use crate::credential::{parse_bearer, CredentialHasher};
use crate::error::{LedgerError, MeterError};
use crate::pricing::price_operation;
use crate::types::{BillingOutcome, Credits, Operation, Principal, UpstreamServer, UsageEvent};

/// Position of a request in the metering state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Authenticated,
    ServerResolved,
    ComplianceChecked,
    Priced,
    Admitted,
    Dispatched,
    Billed,
    Logged,
    Responded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "RECEIVED",
            Stage::Authenticated => "AUTHENTICATED",
            Stage::ServerResolved => "SERVER_RESOLVED",
            Stage::ComplianceChecked => "COMPLIANCE_CHECKED",
            Stage::Priced => "PRICED",
            Stage::Admitted => "ADMITTED",
            Stage::Dispatched => "DISPATCHED",
            Stage::Billed => "BILLED",
            Stage::Logged => "LOGGED",
            Stage::Responded => "RESPONDED",
        };
        f.write_str(s)
    }
}

/// A proxied call as received from the transport layer.
#[derive(Debug, Clone)]
pub struct InboundCall {
    /// Raw `Authorization` header value, if any.
    pub authorization: Option<String>,
    pub server_id: String,
    pub body: Bytes,
    /// Gateway-generated correlation id.
    pub request_id: String,
}

/// Per-request context threaded through every stage.
#[derive(Debug, Clone)]
struct RequestContext {
    request_id: String,
    stage: Stage,
}

impl RequestContext {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            stage: Stage::Received,
        }
    }

    fn advance(&mut self, next: Stage) {
        tracing::debug!(request_id = %self.request_id, from = %self.stage, to = %next, "stage transition");
        self.stage = next;
    }

    fn reject(&self, err: MeterError) -> MeterError {
        tracing::info!(request_id = %self.request_id, stage = %self.stage, error = %err, "request rejected");
        err
    }
}

/// A request that cleared every pre-dispatch check. Owned so it can move
/// into the settlement task.
#[derive(Debug, Clone)]
struct AdmittedCall {
    ctx: RequestContext,
    principal: Principal,
    server: UpstreamServer,
    cost: Credits,
}

/// Everything that happened after admission.
#[derive(Debug, Clone)]
pub struct Settlement {
    /// The upstream reply, or the structured reason it could not be obtained.
    pub dispatch: Result<UpstreamResponse, DispatchFailure>,
    /// The usage event that was (or should have been) appended.
    pub usage: UsageEvent,
    /// Whether the usage append succeeded.
    pub recorded: bool,
    pub dispatch_latency: Duration,
    /// Last stage reached by the settlement task. Responding is the caller's job.
    pub stage: Stage,
}

/// Sequences authentication, compliance, pricing, admission, dispatch,
/// billing and recording for each inbound call.
#[derive(Clone)]
pub struct Orchestrator<S, D> {
    store: S,
    dispatcher: D,
    hasher: CredentialHasher,
}

impl<S: MeterStore, D: Dispatcher> Orchestrator<S, D> {
    pub fn new(store: S, dispatcher: D, hasher: CredentialHasher) -> Self {
        Self {
            store,
            dispatcher,
            hasher,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve a raw `Authorization` header to a principal.
    ///
    /// Missing/malformed headers are `Unauthenticated`; unknown and revoked
    /// keys both yield `InvalidCredential`.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, MeterError> {
        let raw_key = parse_bearer(authorization)?;
        let digest = self.hasher.digest(raw_key);
        let record = self
            .store
            .find_key(&digest)
            .await?
            .ok_or(MeterError::InvalidCredential)?;

        if !self.hasher.verify(raw_key, &record.key_hash) || record.revoked {
            tracing::warn!(key_id = %record.key_id, "rejected revoked or mismatched API key");
            return Err(MeterError::InvalidCredential);
        }
        Ok(record.principal())
    }

    /// Run one inbound call through the full pipeline.
    ///
    /// `Err` means the request was rejected before dispatch and nothing was
    /// charged or recorded. `Ok` means dispatch happened; the settlement
    /// carries the upstream result and the recorded usage event.
    pub async fn handle(&self, call: InboundCall) -> Result<Settlement, MeterError> {
        let principal = match self.authenticate(call.authorization.as_deref()).await {
            Ok(p) => p,
            Err(e) => return Err(RequestContext::new(call.request_id.clone()).reject(e)),
        };
        self.handle_authenticated(principal, call).await
    }

    /// Run a call whose caller was already resolved, e.g. by a transport that
    /// authenticates before reading the body.
    pub async fn handle_authenticated(
        &self,
        principal: Principal,
        call: InboundCall,
    ) -> Result<Settlement, MeterError> {
        let admitted = self.admit(principal, &call).await?;

        let store = self.store.clone();
        let dispatcher = self.dispatcher.clone();
        let body = call.body;
        let settle = tokio::spawn(async move { settle(store, dispatcher, admitted, body).await });

        settle
            .await
            .map_err(|e| MeterError::Internal(format!("settlement task failed: {e}")))
    }

    async fn admit(
        &self,
        principal: Principal,
        call: &InboundCall,
    ) -> Result<AdmittedCall, MeterError> {
        let mut ctx = RequestContext::new(call.request_id.clone());
        ctx.advance(Stage::Authenticated);

        let server = self
            .store
            .server(&call.server_id)
            .await
            .map_err(|e| ctx.reject(e))?
            .ok_or_else(|| ctx.reject(MeterError::ServerNotFound(call.server_id.clone())))?;
        ctx.advance(Stage::ServerResolved);

        let status = self
            .store
            .status(&server.id)
            .await
            .map_err(|e| ctx.reject(e))?
            .ok_or_else(|| ctx.reject(MeterError::ServerNotFound(call.server_id.clone())))?;
        if !status.admits_traffic() {
            return Err(ctx.reject(MeterError::ServerNotCompliant(status)));
        }
        ctx.advance(Stage::ComplianceChecked);

        let operation = Operation::from_body(&call.body).map_err(|e| ctx.reject(e))?;
        let cost = price_operation(&server, &operation);
        ctx.advance(Stage::Priced);

        // Advisory check; the authoritative one is the conditional debit.
        let balance = self
            .store
            .balance(&principal.id)
            .await
            .map_err(|e| ctx.reject(e.into_meter_error(&principal.id)))?;
        if balance < cost {
            return Err(ctx.reject(MeterError::InsufficientFunds { balance, cost }));
        }
        ctx.advance(Stage::Admitted);

        tracing::info!(
            request_id = %ctx.request_id,
            user_id = %principal.id,
            server_id = %server.id,
            method = %operation.method,
            tool = operation.tool_name.as_deref().unwrap_or("-"),
            cost,
            "request admitted"
        );

        Ok(AdmittedCall {
            ctx,
            principal,
            server,
            cost,
        })
    }
}

async fn settle<S: MeterStore, D: Dispatcher>(
    store: S,
    dispatcher: D,
    admitted: AdmittedCall,
    body: Bytes,
) -> Settlement {
    let AdmittedCall {
        mut ctx,
        principal,
        server,
        cost,
    } = admitted;

    let started = Instant::now();
    let dispatch = dispatcher.forward(&server, body, &ctx.request_id).await;
    let dispatch_latency = started.elapsed();
    ctx.advance(Stage::Dispatched);

    let upstream_status = dispatch.as_ref().ok().map(|r| r.status);
    let is_success = dispatch.as_ref().map(|r| r.is_success()).unwrap_or(false);
    if let Err(ref failure) = dispatch {
        tracing::warn!(
            request_id = %ctx.request_id,
            server_id = %server.id,
            failure = ?failure,
            "upstream dispatch failed"
        );
    }

    let billing = if is_success {
        let outcome = bill(&store, &ctx.request_id, &principal.id, cost).await;
        ctx.advance(Stage::Billed);
        outcome
    } else {
        BillingOutcome::NotCharged
    };

    let usage = UsageEvent {
        user_id: principal.id.clone(),
        server_id: server.id.clone(),
        api_key_id: principal.api_key_id.clone(),
        cost,
        is_success,
        billing,
        gateway_request_id: ctx.request_id.clone(),
        upstream_status,
        timestamp: Utc::now(),
    };

    let recorded = match store.record(&usage).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                alert = "recording_failure",
                request_id = %ctx.request_id,
                user_id = %principal.id,
                server_id = %server.id,
                cost,
                error = %e,
                "failed to record usage event"
            );
            false
        }
    };
    ctx.advance(Stage::Logged);

    Settlement {
        dispatch,
        usage,
        recorded,
        dispatch_latency,
        stage: ctx.stage,
    }
}

/// Debit exactly once. A failure here is reported for reconciliation and
/// never reaches the caller.
async fn bill<S: MeterStore>(
    store: &S,
    request_id: &str,
    user_id: &str,
    cost: Credits,
) -> BillingOutcome {
    match store.debit(user_id, cost).await {
        Ok(new_balance) => {
            tracing::info!(request_id = %request_id, user_id = %user_id, cost, new_balance, "credits debited");
            BillingOutcome::Charged
        }
        Err(e) => {
            let reason = match e {
                LedgerError::InsufficientFunds => "balance spent by a concurrent request",
                LedgerError::WalletNotFound => "wallet disappeared after admission",
                LedgerError::Storage(_) => "ledger storage error",
            };
            tracing::error!(
                alert = "billing_failure",
                reconcile = true,
                request_id = %request_id,
                user_id = %user_id,
                cost,
                reason,
                error = %e,
                "CRITICAL: failed to debit credits after successful upstream call"
            );
            BillingOutcome::Failed
        }
    }
}

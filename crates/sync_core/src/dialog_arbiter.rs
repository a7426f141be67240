use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use shared::{
    domain::{DialogRequest, DialogResponse, RequestId},
    error::SyncError,
};
use tracing::{debug, info};

use crate::subscription::{lock, ListenerSet, Subscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDialog {
    pub request_id: RequestId,
    pub request: DialogRequest,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogNotice {
    Raised(PendingDialog),
    Resolved(DialogResponse),
    /// Closed without an operator decision.
    Dismissed(RequestId),
}

/// Single-slot arbiter: at most one dialog awaits a decision at any time.
///
/// A second request while one is pending is rejected with
/// [`SyncError::DialogBusy`]; nothing is queued. Watchers follow the same
/// re-entrancy rule as the status registry.
#[derive(Default)]
pub struct DialogArbiter {
    pending: Mutex<Option<PendingDialog>>,
    dispatch: Mutex<()>,
    listeners: ListenerSet<DialogNotice>,
}

impl DialogArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, request: DialogRequest) -> Result<RequestId, SyncError> {
        let request_id = RequestId::new();
        self.raise(request_id, request)?;
        Ok(request_id)
    }

    /// Installs a request whose id was assigned elsewhere. Adopting the
    /// request that is already pending is a no-op.
    pub fn adopt(&self, request_id: RequestId, request: DialogRequest) -> Result<(), SyncError> {
        self.raise(request_id, request)
    }

    /// Accepts the operator's choice for the pending request. Any label is
    /// accepted; callers validate against the offered buttons if they care.
    pub fn respond(
        &self,
        request_id: RequestId,
        button_label: impl Into<String>,
    ) -> Result<DialogResponse, SyncError> {
        self.respond_with(request_id, button_label, |_| Ok(()))
    }

    /// Resolves the pending request only once `deliver` accepts the
    /// response. The slot cannot be replaced or dismissed in between; if
    /// `deliver` fails the request stays pending and nobody is notified.
    pub fn respond_with(
        &self,
        request_id: RequestId,
        button_label: impl Into<String>,
        deliver: impl FnOnce(&DialogResponse) -> Result<(), SyncError>,
    ) -> Result<DialogResponse, SyncError> {
        let _dispatch = lock(&self.dispatch);
        let response = match lock(&self.pending).as_ref() {
            Some(current) if current.request_id == request_id => {
                DialogResponse::new(request_id, button_label)
            }
            _ => return Err(SyncError::StaleResponse { request_id }),
        };
        deliver(&response)?;
        lock(&self.pending).take();
        info!(%request_id, button = %response.button_label, "dialog resolved");
        self.listeners.emit(&DialogNotice::Resolved(response.clone()));
        Ok(response)
    }

    /// Resolves the pending request with the cancel sentinel.
    pub fn cancel(&self) -> Option<DialogResponse> {
        self.cancel_with(|_| Ok(())).unwrap_or_default()
    }

    /// Cancel counterpart of [`DialogArbiter::respond_with`].
    pub fn cancel_with(
        &self,
        deliver: impl FnOnce(&DialogResponse) -> Result<(), SyncError>,
    ) -> Result<Option<DialogResponse>, SyncError> {
        let _dispatch = lock(&self.dispatch);
        let Some(request_id) = lock(&self.pending).as_ref().map(|pending| pending.request_id)
        else {
            return Ok(None);
        };
        let response = DialogResponse::cancelled(request_id);
        deliver(&response)?;
        lock(&self.pending).take();
        info!(%request_id, "dialog cancelled");
        self.listeners.emit(&DialogNotice::Resolved(response.clone()));
        Ok(Some(response))
    }

    /// Returns to idle without producing a response.
    pub fn dismiss(&self) -> Option<RequestId> {
        let _dispatch = lock(&self.dispatch);
        let pending = lock(&self.pending).take()?;
        debug!(request_id = %pending.request_id, "dialog dismissed");
        self.listeners
            .emit(&DialogNotice::Dismissed(pending.request_id));
        Some(pending.request_id)
    }

    pub fn pending(&self) -> Option<PendingDialog> {
        lock(&self.pending).clone()
    }

    pub fn is_idle(&self) -> bool {
        lock(&self.pending).is_none()
    }

    /// Replays the pending request (if any) as `Raised`, then follows changes.
    pub fn watch(&self, callback: impl Fn(&DialogNotice) + Send + Sync + 'static) -> Subscription {
        let callback = Arc::new(callback);
        let _dispatch = lock(&self.dispatch);
        if let Some(pending) = self.pending() {
            callback(&DialogNotice::Raised(pending));
        }
        self.listeners.insert(move |notice| callback(notice))
    }

    fn raise(&self, request_id: RequestId, request: DialogRequest) -> Result<(), SyncError> {
        let _dispatch = lock(&self.dispatch);
        let raised = {
            let mut pending = lock(&self.pending);
            match pending.as_ref() {
                Some(current) if current.request_id == request_id => return Ok(()),
                Some(current) => {
                    return Err(SyncError::DialogBusy {
                        pending: current.request_id,
                    })
                }
                None => {}
            }
            let raised = PendingDialog {
                request_id,
                request,
                raised_at: Utc::now(),
            };
            *pending = Some(raised.clone());
            raised
        };
        info!(%request_id, message = %raised.request.text(), "dialog raised");
        self.listeners.emit(&DialogNotice::Raised(raised));
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/dialog_arbiter_tests.rs"]
mod tests;

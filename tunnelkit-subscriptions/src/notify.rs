//! User-visible outcomes handed to the UI layer.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tunnelkit_lib::{AccountId, InvoiceId};

/// Something the account holder should be told.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    Granted {
        account: AccountId,
        expires_at: DateTime<Utc>,
        credential_uri: Option<String>,
    },
    Extended {
        account: AccountId,
        expires_at: DateTime<Utc>,
        credential_uri: Option<String>,
    },
    /// The old URI no longer works.
    CredentialRotated {
        account: AccountId,
        credential_uri: String,
    },
    PaymentReminder {
        account: AccountId,
        invoice_id: InvoiceId,
        pay_url: Option<String>,
    },
    PaymentWindowClosed {
        account: AccountId,
        invoice_id: InvoiceId,
    },
    GrantFailed {
        account: AccountId,
        grant_id: String,
        attempts_left: u32,
    },
    Escalated {
        account: AccountId,
        grant_id: String,
    },
}

impl Notice {
    pub fn account(&self) -> AccountId {
        match self {
            Notice::Granted { account, .. }
            | Notice::Extended { account, .. }
            | Notice::CredentialRotated { account, .. }
            | Notice::PaymentReminder { account, .. }
            | Notice::PaymentWindowClosed { account, .. }
            | Notice::GrantFailed { account, .. }
            | Notice::Escalated { account, .. } => *account,
        }
    }
}

/// Delivery is fire-and-forget; a notifier handles its own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: Notice);
}

/// Drops every notice.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notice: Notice) {}
}

/// Keeps every notice in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices so far, oldest first.
    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, pred: impl Fn(&Notice) -> bool) -> usize {
        self.notices().iter().filter(|n| pred(n)).count()
    }

    pub fn clear(&self) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: Notice) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice);
    }
}

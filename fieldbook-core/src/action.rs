use std::fmt;
use std::str::FromStr;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mutations a device can queue for delivery to the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    StartSession,
    EndSession,
    UpdateSession,
    CreateClient,
    UpdateClient,
    CreateBillingRate,
    CreateInvoice,
    DeleteInvoice,
}

#[derive(Debug, Error)]
#[error("unknown action kind: {0}")]
pub struct UnknownActionKind(pub String);

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::StartSession,
        ActionKind::EndSession,
        ActionKind::UpdateSession,
        ActionKind::CreateClient,
        ActionKind::UpdateClient,
        ActionKind::CreateBillingRate,
        ActionKind::CreateInvoice,
        ActionKind::DeleteInvoice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::StartSession => "start-session",
            ActionKind::EndSession => "end-session",
            ActionKind::UpdateSession => "update-session",
            ActionKind::CreateClient => "create-client",
            ActionKind::UpdateClient => "update-client",
            ActionKind::CreateBillingRate => "create-billing-rate",
            ActionKind::CreateInvoice => "create-invoice",
            ActionKind::DeleteInvoice => "delete-invoice",
        }
    }

    /// HTTP method and path of the endpoint that accepts this action's payload.
    pub fn endpoint(&self) -> (Method, &'static str) {
        match self {
            ActionKind::StartSession => (Method::POST, "/v1/sessions"),
            ActionKind::EndSession => (Method::POST, "/v1/sessions/end"),
            ActionKind::UpdateSession => (Method::PATCH, "/v1/sessions"),
            ActionKind::CreateClient => (Method::POST, "/v1/clients"),
            ActionKind::UpdateClient => (Method::PATCH, "/v1/clients"),
            ActionKind::CreateBillingRate => (Method::POST, "/v1/billing-rates"),
            ActionKind::CreateInvoice => (Method::POST, "/v1/invoices"),
            ActionKind::DeleteInvoice => (Method::DELETE, "/v1/invoices"),
        }
    }

    /// Create actions mint a resource whose server id may differ from the
    /// placeholder the device assigned.
    pub fn creates_resource(&self) -> bool {
        matches!(
            self,
            ActionKind::StartSession
                | ActionKind::CreateClient
                | ActionKind::CreateBillingRate
                | ActionKind::CreateInvoice
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = UnknownActionKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownActionKind(value.to_string()))
    }
}

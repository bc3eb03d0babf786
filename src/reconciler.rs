//! Instance lifecycle reconciliation.
//!
//! Business rule: one WhatsApp instance per account. Every connect request
//! runs the same convergence pass: reuse the local row when it is healthy,
//! re-derive its state from the provider when it is not, and recreate it
//! under the same deterministic name when the provider lost it out-of-band.

use crate::error::{ApiError, ProviderError};
use crate::evolution::{ConnectionState, WhatsAppProvider};
use crate::models::{Instance, InstanceStatus, InstanceUpdate, NewInstance};
use crate::store::InstanceStore;
use log::{error, info, warn};
use std::sync::Arc;
use uuid::Uuid;

/// Name an account's instance when the client does not supply one. Stable
/// across recreations: `instance-{account id with separators stripped}`.
pub fn derive_instance_name(account_id: Uuid) -> String {
    format!("instance-{}", account_id.simple())
}

#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub instance_id: Uuid,
    pub instance_name: String,
    pub status: InstanceStatus,
    pub phone_number: Option<String>,
    pub qr_code: Option<String>,
    pub message: String,
}

pub struct InstanceReconciler {
    store: Arc<dyn InstanceStore>,
    provider: Arc<dyn WhatsAppProvider>,
}

impl InstanceReconciler {
    pub fn new(store: Arc<dyn InstanceStore>, provider: Arc<dyn WhatsAppProvider>) -> Self {
        Self { store, provider }
    }

    /// Full synchronous reconciliation pass.
    pub async fn connect(
        &self,
        account_id: Uuid,
        requested_name: Option<String>,
    ) -> Result<ConnectOutcome, ApiError> {
        self.reconcile(account_id, requested_name).await
    }

    /// Deferred mode: persist the intent and answer immediately; the
    /// provider interaction happens on a detached task that must never
    /// surface an error to the (long gone) caller.
    pub async fn connect_deferred(
        self: &Arc<Self>,
        account_id: Uuid,
        requested_name: Option<String>,
    ) -> Result<ConnectOutcome, ApiError> {
        if let Some(instance) = self.store.get_by_account_id(account_id).await? {
            if instance.status == InstanceStatus::Connected && instance.phone_number.is_some() {
                return Ok(connected_outcome(instance));
            }
            if instance.status == InstanceStatus::Initializing {
                // Either a background task is mid-flight or a crash left
                // the row unprovisioned. Re-arm the task either way: a
                // duplicate provider call is tolerated, a wedged account
                // is not.
                self.spawn_background(account_id);
                return Ok(in_progress_outcome(instance));
            }
            self.store
                .update(
                    instance.id,
                    InstanceUpdate {
                        status: Some(InstanceStatus::Connecting),
                        ..Default::default()
                    },
                )
                .await?;
            self.spawn_background(account_id);
            return Ok(ConnectOutcome {
                instance_id: instance.id,
                instance_name: instance.name,
                status: InstanceStatus::Connecting,
                phone_number: instance.phone_number,
                qr_code: None,
                message: "Reconnection in progress; poll for the QR code".to_string(),
            });
        }

        let name = requested_name.unwrap_or_else(|| derive_instance_name(account_id));
        let instance = self
            .store
            .create(NewInstance {
                account_id,
                name,
                status: InstanceStatus::Initializing,
            })
            .await?;
        self.spawn_background(account_id);
        Ok(in_progress_outcome(instance))
    }

    fn spawn_background(self: &Arc<Self>, account_id: Uuid) {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = reconciler.reconcile(account_id, None).await {
                // The caller already got its 202; all we can do is record
                // the failure and let the next connect request retry.
                error!(
                    "Background reconciliation failed for account {}: {}",
                    account_id, e
                );
                if let Ok(Some(instance)) = reconciler.store.get_by_account_id(account_id).await {
                    let degrade = reconciler
                        .store
                        .update(
                            instance.id,
                            InstanceUpdate {
                                status: Some(InstanceStatus::Disconnected),
                                ..Default::default()
                            },
                        )
                        .await;
                    if let Err(e) = degrade {
                        error!("Failed to degrade instance {}: {}", instance.id, e);
                    }
                }
            }
        });
    }

    async fn reconcile(
        &self,
        account_id: Uuid,
        requested_name: Option<String>,
    ) -> Result<ConnectOutcome, ApiError> {
        match self.store.get_by_account_id(account_id).await? {
            // An existing row always wins over a client-supplied name.
            Some(instance) => {
                if instance.status == InstanceStatus::Initializing {
                    // The provider has never heard of this row, whether it
                    // came from a deferred request a moment ago or from a
                    // crash before provisioning ran. Provision it now.
                    return self.provision(instance).await;
                }
                self.reconcile_existing(instance).await
            }
            None => {
                let name = requested_name.unwrap_or_else(|| derive_instance_name(account_id));
                self.create_fresh(account_id, name).await
            }
        }
    }

    async fn reconcile_existing(&self, instance: Instance) -> Result<ConnectOutcome, ApiError> {
        // Healthy local state needs no provider round-trip.
        if instance.status == InstanceStatus::Connected && instance.phone_number.is_some() {
            info!(
                "Instance {} already connected as {}; skipping provider check",
                instance.name,
                instance.phone_number.as_deref().unwrap_or_default()
            );
            return Ok(connected_outcome(instance));
        }

        let state = match self.provider.get_instance_status(&instance.name).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                return self.heal_missing_remote(instance).await;
            }
            // A timeout or transport failure does not mean the remote
            // instance is gone; leave local state alone and surface it.
            Err(e) => return Err(ApiError::Provider(e)),
        };

        match state {
            ConnectionState::Open => {
                self.store
                    .update(
                        instance.id,
                        InstanceUpdate {
                            status: Some(InstanceStatus::Connected),
                            qr_code: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ConnectOutcome {
                    instance_id: instance.id,
                    instance_name: instance.name,
                    status: InstanceStatus::Connected,
                    phone_number: instance.phone_number,
                    qr_code: None,
                    message: "Instance is connected".to_string(),
                })
            }
            ConnectionState::Connecting => {
                // Remote is mid-handshake; report progress, keep any QR we
                // already have.
                self.store
                    .update(
                        instance.id,
                        InstanceUpdate {
                            status: Some(InstanceStatus::Connecting),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ConnectOutcome {
                    instance_id: instance.id,
                    instance_name: instance.name,
                    status: InstanceStatus::Connecting,
                    phone_number: instance.phone_number,
                    qr_code: instance.qr_code,
                    message: "Connection in progress".to_string(),
                })
            }
            ConnectionState::Close => self.request_fresh_qr(instance).await,
        }
    }

    async fn request_fresh_qr(&self, instance: Instance) -> Result<ConnectOutcome, ApiError> {
        match self.provider.connect_instance(&instance.name).await {
            Ok(Some(qr)) => {
                self.store
                    .update(
                        instance.id,
                        InstanceUpdate {
                            status: Some(InstanceStatus::Connecting),
                            qr_code: Some(Some(qr.clone())),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ConnectOutcome {
                    instance_id: instance.id,
                    instance_name: instance.name,
                    status: InstanceStatus::Connecting,
                    phone_number: None,
                    qr_code: Some(qr),
                    message: "Scan the QR code with WhatsApp to reconnect".to_string(),
                })
            }
            Ok(None) => {
                // Provider accepted but has no QR yet; it will arrive via
                // the qrcode.update webhook.
                self.store
                    .update(
                        instance.id,
                        InstanceUpdate {
                            status: Some(InstanceStatus::Connecting),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ConnectOutcome {
                    instance_id: instance.id,
                    instance_name: instance.name,
                    status: InstanceStatus::Connecting,
                    phone_number: None,
                    qr_code: None,
                    message: "Waiting for QR code; poll again in a few seconds".to_string(),
                })
            }
            Err(e) if e.is_not_found() => self.heal_missing_remote(instance).await,
            Err(e) => Err(ApiError::Provider(e)),
        }
    }

    /// The provider lost the instance out-of-band. Drop the stale local row
    /// and recreate under the same name so the account converges on a fresh
    /// QR cycle instead of erroring forever.
    async fn heal_missing_remote(&self, instance: Instance) -> Result<ConnectOutcome, ApiError> {
        warn!(
            "Instance {} exists locally but not on the provider; recreating",
            instance.name
        );
        self.store.delete(instance.id).await?;
        self.create_fresh(instance.account_id, instance.name).await
    }

    async fn create_fresh(
        &self,
        account_id: Uuid,
        name: String,
    ) -> Result<ConnectOutcome, ApiError> {
        info!("Creating instance {} for account {}", name, account_id);
        // Persist the intent first: if the provider call fails the row stays
        // at `connecting` and the next connect request resumes from it.
        let instance = self
            .store
            .create(NewInstance {
                account_id,
                name,
                status: InstanceStatus::Connecting,
            })
            .await?;
        self.provision(instance).await
    }

    /// Run the provider create/adopt sequence for a row that exists locally
    /// but not yet on the provider.
    async fn provision(&self, instance: Instance) -> Result<ConnectOutcome, ApiError> {
        let name = instance.name.clone();
        let qr = match self.provider.create_instance(&name).await {
            Ok(Some(qr)) => Some(qr),
            Ok(None) => {
                // Some provider builds only hand the QR out on connect.
                self.provider.connect_instance(&name).await?
            }
            Err(ProviderError::Forbidden) => {
                // The provider already has an instance under this name that
                // the local store never saw. Adopt it.
                warn!(
                    "Instance {} already exists on the provider; adopting it",
                    name
                );
                self.provider.connect_instance(&name).await?
            }
            Err(e) => return Err(ApiError::Provider(e)),
        };

        self.store
            .update(
                instance.id,
                InstanceUpdate {
                    status: Some(InstanceStatus::Connecting),
                    qr_code: qr.clone().map(Some),
                    ..Default::default()
                },
            )
            .await?;

        let message = if qr.is_some() {
            "Scan the QR code with WhatsApp".to_string()
        } else {
            "Instance created; the QR code will arrive via webhook".to_string()
        };
        Ok(ConnectOutcome {
            instance_id: instance.id,
            instance_name: name,
            status: InstanceStatus::Connecting,
            phone_number: None,
            qr_code: qr,
            message,
        })
    }
}

fn connected_outcome(instance: Instance) -> ConnectOutcome {
    ConnectOutcome {
        instance_id: instance.id,
        instance_name: instance.name,
        status: InstanceStatus::Connected,
        phone_number: instance.phone_number,
        qr_code: None,
        message: "Instance already connected".to_string(),
    }
}

fn in_progress_outcome(instance: Instance) -> ConnectOutcome {
    ConnectOutcome {
        instance_id: instance.id,
        instance_name: instance.name,
        status: InstanceStatus::Initializing,
        phone_number: None,
        qr_code: None,
        message: "Instance provisioning in progress".to_string(),
    }
}

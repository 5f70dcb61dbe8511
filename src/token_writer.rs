//! Credential secret reconciliation
//!
//! Projects the in-memory endpoint set into cluster Secrets and keeps
//! them there: stale secrets from previous runs are purged at startup,
//! the desired set is created, and a label-filtered watch repairs any
//! external mutation or deletion afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{Authorizer, Endpoint};
use crate::error::Error;

/// Label key marking secrets as owned by this proxy
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label value marking secrets as owned by this proxy
pub const MANAGED_BY_VALUE: &str = "git-auth-proxy";
/// Annotation carrying the owning endpoint's identity
pub const ENDPOINT_ID_ANNOTATION: &str = "git-auth-proxy.xenit.io/id";

const USERNAME_KEY: &str = "username";
const USERNAME_VALUE: &str = "git";
const PASSWORD_KEY: &str = "password";
const TOKEN_KEY: &str = "token";

const FIELD_MANAGER: &str = "git-auth-proxy";

/// Reconciliation loop keeping credential secrets in line with the
/// endpoint set
pub struct TokenWriter {
    client: Client,
    authorizer: Arc<Authorizer>,
}

impl TokenWriter {
    /// Create a token writer for the given cluster client.
    pub fn new(client: Client, authorizer: Arc<Authorizer>) -> Self {
        Self { client, authorizer }
    }

    /// Run bootstrap and then watch until the shutdown token is cancelled.
    ///
    /// A bootstrap failure is returned and must be treated as fatal;
    /// failures while handling watch events are logged and the loop
    /// continues.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        info!("starting token writer");
        self.bootstrap().await?;
        self.watch(shutdown).await;
        info!("token writer stopped");
        Ok(())
    }

    fn label_selector() -> String {
        format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
    }

    /// Delete every managed secret left from previous runs, then create
    /// the desired set.
    async fn bootstrap(&self) -> Result<(), Error> {
        let all: Api<Secret> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&Self::label_selector());
        let stale = all.list(&params).await?;
        for secret in stale.items {
            let name = secret.name_any();
            let Some(namespace) = secret.namespace() else {
                continue;
            };
            let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
            api.delete(&name, &DeleteParams::default()).await?;
            info!(%name, %namespace, "deleted stale secret");
        }

        for endpoint in self.authorizer.endpoints() {
            for namespace in &endpoint.namespaces {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let secret = desired_secret(endpoint, namespace);
                api.create(&PostParams::default(), &secret).await?;
                info!(name = %endpoint.secret_name, %namespace, "created secret");
            }
        }
        Ok(())
    }

    /// Watch managed secrets and repair drift and deletions.
    async fn watch(&self, shutdown: CancellationToken) {
        let api: Api<Secret> = Api::all(self.client.clone());
        let config = watcher::Config::default().labels(&Self::label_selector());
        let mut stream = watcher::watcher(api, config).boxed();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.try_next() => match event {
                    Ok(Some(Event::Apply(secret)) | Some(Event::InitApply(secret))) => {
                        if let Err(e) = self.handle_apply(&secret).await {
                            error!(name = %secret.name_any(), error = %e, "could not reconcile updated secret");
                        }
                    }
                    Ok(Some(Event::Delete(secret))) => {
                        if let Err(e) = self.handle_delete(&secret).await {
                            error!(name = %secret.name_any(), error = %e, "could not recreate deleted secret");
                        }
                    }
                    Ok(Some(Event::Init | Event::InitDone)) => {}
                    Ok(None) => break,
                    // The watcher restarts itself; failures here are transient
                    Err(e) => error!(error = %e, "secret watch error"),
                },
            }
        }
    }

    fn endpoint_for(&self, secret: &Secret) -> Option<&Arc<Endpoint>> {
        let id = secret.annotations().get(ENDPOINT_ID_ANNOTATION)?;
        self.authorizer.endpoint_by_id(id)
    }

    /// Overwrite a secret whose content drifted from the desired state.
    async fn handle_apply(&self, secret: &Secret) -> Result<(), Error> {
        let Some(endpoint) = self.endpoint_for(secret) else {
            debug!(name = %secret.name_any(), "updated secret does not match a known endpoint");
            return Ok(());
        };
        let Some(namespace) = secret.namespace() else {
            return Ok(());
        };
        if secret_matches(endpoint, secret) {
            return Ok(());
        }
        warn!(
            name = %endpoint.secret_name,
            %namespace,
            "secret drifted from desired state, overwriting"
        );
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let desired = apply_patch(&desired_secret(endpoint, &namespace))?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&endpoint.secret_name, &params, &Patch::Apply(&desired))
            .await?;
        Ok(())
    }

    /// Recreate a deleted secret for its endpoint.
    async fn handle_delete(&self, secret: &Secret) -> Result<(), Error> {
        let Some(endpoint) = self.endpoint_for(secret) else {
            warn!(
                name = %secret.name_any(),
                "deleted secret does not match a known endpoint"
            );
            return Ok(());
        };
        let Some(namespace) = secret.namespace() else {
            return Ok(());
        };
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let desired = desired_secret(endpoint, &namespace);
        match api.create(&PostParams::default(), &desired).await {
            Ok(_) => {
                info!(name = %endpoint.secret_name, %namespace, "recreated deleted secret");
                Ok(())
            }
            // Someone beat us to it; repeated delivery of the same delete
            // event must stay idempotent
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A server-side-apply patch body for a secret.
///
/// Typed objects serialize without apiVersion and kind, which apply
/// patches must carry.
fn apply_patch(secret: &Secret) -> Result<serde_json::Value, Error> {
    let mut value = serde_json::to_value(secret)
        .map_err(|e| Error::internal(format!("could not serialize secret: {e}")))?;
    value["apiVersion"] = serde_json::Value::String("v1".to_string());
    value["kind"] = serde_json::Value::String("Secret".to_string());
    Ok(value)
}

/// The secret an endpoint dictates for one of its namespaces.
fn desired_secret(endpoint: &Endpoint, namespace: &str) -> Secret {
    let token = endpoint.token.as_str();
    Secret {
        metadata: ObjectMeta {
            name: Some(endpoint.secret_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                ENDPOINT_ID_ANNOTATION.to_string(),
                endpoint.id(),
            )])),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([
            (USERNAME_KEY.to_string(), USERNAME_VALUE.to_string()),
            (PASSWORD_KEY.to_string(), token.to_string()),
            (TOKEN_KEY.to_string(), token.to_string()),
        ])),
        ..Default::default()
    }
}

/// Whether an observed secret still matches what its endpoint dictates.
fn secret_matches(endpoint: &Endpoint, secret: &Secret) -> bool {
    if secret.labels().get(MANAGED_BY_LABEL).map(String::as_str) != Some(MANAGED_BY_VALUE) {
        return false;
    }
    if secret.annotations().get(ENDPOINT_ID_ANNOTATION) != Some(&endpoint.id()) {
        return false;
    }
    let token = endpoint.token.as_str();
    let expected = [
        (USERNAME_KEY, USERNAME_VALUE),
        (PASSWORD_KEY, token),
        (TOKEN_KEY, token),
    ];
    expected
        .iter()
        .all(|(key, value)| data_field(secret, key).as_deref() == Some(value.as_bytes()))
}

/// A secret data field, whether delivered as raw data or string data.
fn data_field(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    if let Some(value) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Some(value.clone().into_bytes());
    }
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|bytes| bytes.0.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use k8s_openapi::ByteString;

    fn authorizer() -> Authorizer {
        let cfg = Configuration::from_json(
            br#"{
                "organizations": [{
                    "provider": "azuredevops",
                    "host": "dev.azure.com",
                    "name": "org",
                    "azuredevops": {"pat": "p"},
                    "repositories": [
                        {"name": "repo", "project": "proj", "namespaces": ["team-a", "team-b"]}
                    ]
                }]
            }"#,
        )
        .unwrap();
        Authorizer::new(&cfg).unwrap()
    }

    #[test]
    fn desired_secret_carries_identity_and_credentials() {
        let authz = authorizer();
        let endpoint = &authz.endpoints()[0];
        let secret = desired_secret(endpoint, "team-a");

        assert_eq!(secret.metadata.name.as_deref(), Some("org-proj-repo"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("team-a"));
        assert_eq!(
            secret.labels().get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
        assert_eq!(
            secret.annotations().get(ENDPOINT_ID_ANNOTATION),
            Some(&endpoint.id())
        );

        let data = secret.string_data.as_ref().unwrap();
        assert_eq!(data.get("username").map(String::as_str), Some("git"));
        assert_eq!(data.get("password").map(String::as_str), Some(endpoint.token.as_str()));
        assert_eq!(data.get("token").map(String::as_str), Some(endpoint.token.as_str()));
    }

    #[test]
    fn pristine_secrets_match_their_endpoint() {
        let authz = authorizer();
        let endpoint = &authz.endpoints()[0];
        let secret = desired_secret(endpoint, "team-a");
        assert!(secret_matches(endpoint, &secret));
    }

    #[test]
    fn drifted_data_is_detected() {
        let authz = authorizer();
        let endpoint = &authz.endpoints()[0];

        let mut secret = desired_secret(endpoint, "team-a");
        secret
            .string_data
            .as_mut()
            .unwrap()
            .insert("token".to_string(), "tampered".to_string());
        assert!(!secret_matches(endpoint, &secret));

        let mut secret = desired_secret(endpoint, "team-a");
        secret.string_data = None;
        secret.data = Some(BTreeMap::from([
            ("username".to_string(), ByteString(b"git".to_vec())),
            (
                "password".to_string(),
                ByteString(endpoint.token.as_str().as_bytes().to_vec()),
            ),
            (
                "token".to_string(),
                ByteString(endpoint.token.as_str().as_bytes().to_vec()),
            ),
        ]));
        assert!(secret_matches(endpoint, &secret), "server-side data representation should match");

        secret.data.as_mut().unwrap().remove("token");
        assert!(!secret_matches(endpoint, &secret));
    }

    #[test]
    fn foreign_annotations_never_match() {
        let authz = authorizer();
        let endpoint = &authz.endpoints()[0];
        let mut secret = desired_secret(endpoint, "team-a");
        secret
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(ENDPOINT_ID_ANNOTATION.to_string(), "other-id".to_string());
        assert!(!secret_matches(endpoint, &secret));
    }

    #[test]
    fn apply_patches_carry_type_information() {
        let authz = authorizer();
        let secret = desired_secret(&authz.endpoints()[0], "team-a");
        let patch = apply_patch(&secret).unwrap();
        assert_eq!(patch["apiVersion"], "v1");
        assert_eq!(patch["kind"], "Secret");
        assert_eq!(patch["metadata"]["name"], "org-proj-repo");
    }

    #[test]
    fn endpoint_lookup_uses_the_id_annotation() {
        let authz = authorizer();
        let endpoint_id = authz.endpoints()[0].id();
        let secret = desired_secret(&authz.endpoints()[0], "team-a");
        let id = secret.annotations().get(ENDPOINT_ID_ANNOTATION).unwrap();
        assert_eq!(id, &endpoint_id);
        assert!(authz.endpoint_by_id(id).is_some());
    }
}

use super::{CreateOutcome, ListParams, Registry};
use crate::model::{
    Bag, FixityCheck, Ingest, Member, MessageDigest, NodeRecord, PagedResponse,
    ReplicationTransfer, RestoreTransfer, WorkItem,
};
use crate::{ArkError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// REST client for a node's metadata registry.
///
/// List endpoints return the `{Count, Next, Previous, Results}` envelope;
/// callers follow each page's `Next` cursor via [`ListParams::merge`].
pub struct HttpRegistry {
    client: Client,
    base: Url,
    token: String,
}

impl HttpRegistry {
    pub fn new(api_root: &str, token: &str) -> Result<Self> {
        let normalized = if api_root.ends_with('/') {
            api_root.to_string()
        } else {
            format!("{}/", api_root)
        };
        let base = Url::parse(&normalized)
            .map_err(|error| ArkError::Config(format!("invalid api_root '{}': {}", api_root, error)))?;

        Ok(Self {
            client: Client::new(),
            base,
            token: token.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|error| ArkError::Internal(format!("bad registry path '{}': {}", path, error)))
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            request
        } else {
            request.header("Authorization", format!("Token {}", self.token))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        let response = self.auth(self.client.get(url)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ArkError::NotFound(path.to_string())),
            status if status.is_success() => Ok(response.json::<T>().await?),
            status => Err(ArkError::Registry(format!(
                "GET {} returned {}",
                path, status
            ))),
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &ListParams,
    ) -> Result<PagedResponse<T>> {
        let mut url = self.endpoint(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params.iter() {
                pairs.append_pair(key, value);
            }
        }

        let response = self.auth(self.client.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArkError::Registry(format!(
                "GET {} returned {}",
                path, status
            )));
        }

        Ok(response.json::<PagedResponse<T>>().await?)
    }

    async fn create<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<CreateOutcome> {
        let url = self.endpoint(path)?;
        let response = self.auth(self.client.post(url)).json(body).send().await?;

        match response.status() {
            StatusCode::CONFLICT => Ok(CreateOutcome::AlreadyExists),
            status if status.is_success() => Ok(CreateOutcome::Created),
            status => Err(ArkError::Registry(format!(
                "POST {} returned {}",
                path, status
            ))),
        }
    }

    async fn create_returning<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.endpoint(path)?;
        let response = self.auth(self.client.post(url)).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArkError::Registry(format!(
                "POST {} returned {}",
                path, status
            )));
        }

        Ok(response.json::<T>().await?)
    }

    async fn update<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let url = self.endpoint(path)?;
        let response = self.auth(self.client.put(url)).json(body).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ArkError::NotFound(path.to_string())),
            status if status.is_success() => Ok(()),
            status => Err(ArkError::Registry(format!(
                "PUT {} returned {}",
                path, status
            ))),
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn get_node(&self, namespace: &str) -> Result<NodeRecord> {
        self.get_json(&format!("nodes/{}/", namespace)).await
    }

    async fn create_node(&self, node: &NodeRecord) -> Result<CreateOutcome> {
        self.create("nodes/", node).await
    }

    async fn update_node(&self, node: &NodeRecord) -> Result<()> {
        self.update(&format!("nodes/{}/", node.namespace), node).await
    }

    async fn list_members(&self, params: &ListParams) -> Result<PagedResponse<Member>> {
        self.list("members/", params).await
    }

    async fn create_member(&self, member: &Member) -> Result<CreateOutcome> {
        self.create("members/", member).await
    }

    async fn get_bag(&self, uuid: Uuid) -> Result<Bag> {
        self.get_json(&format!("bags/{}/", uuid)).await
    }

    async fn list_bags(&self, params: &ListParams) -> Result<PagedResponse<Bag>> {
        self.list("bags/", params).await
    }

    async fn create_bag(&self, bag: &Bag) -> Result<CreateOutcome> {
        self.create("bags/", bag).await
    }

    async fn update_bag(&self, bag: &Bag) -> Result<()> {
        self.update(&format!("bags/{}/", bag.uuid), bag).await
    }

    async fn list_ingests(&self, params: &ListParams) -> Result<PagedResponse<Ingest>> {
        self.list("ingests/", params).await
    }

    async fn create_ingest(&self, ingest: &Ingest) -> Result<CreateOutcome> {
        self.create("ingests/", ingest).await
    }

    async fn latest_digest(&self, bag: Uuid, algorithm: &str) -> Result<MessageDigest> {
        self.get_json(&format!("digests/{}/{}/", bag, algorithm)).await
    }

    async fn list_digests(&self, params: &ListParams) -> Result<PagedResponse<MessageDigest>> {
        self.list("digests/", params).await
    }

    async fn create_digest(&self, digest: &MessageDigest) -> Result<CreateOutcome> {
        self.create("digests/", digest).await
    }

    async fn list_fixity_checks(
        &self,
        params: &ListParams,
    ) -> Result<PagedResponse<FixityCheck>> {
        self.list("fixity_checks/", params).await
    }

    async fn create_fixity_check(&self, check: &FixityCheck) -> Result<CreateOutcome> {
        self.create("fixity_checks/", check).await
    }

    async fn get_replication(&self, id: Uuid) -> Result<ReplicationTransfer> {
        self.get_json(&format!("replications/{}/", id)).await
    }

    async fn list_replications(
        &self,
        params: &ListParams,
    ) -> Result<PagedResponse<ReplicationTransfer>> {
        self.list("replications/", params).await
    }

    async fn create_replication(&self, xfer: &ReplicationTransfer) -> Result<CreateOutcome> {
        self.create("replications/", xfer).await
    }

    async fn update_replication(&self, xfer: &ReplicationTransfer) -> Result<()> {
        self.update(&format!("replications/{}/", xfer.replication_id), xfer)
            .await
    }

    async fn get_restore(&self, id: Uuid) -> Result<RestoreTransfer> {
        self.get_json(&format!("restores/{}/", id)).await
    }

    async fn list_restores(&self, params: &ListParams) -> Result<PagedResponse<RestoreTransfer>> {
        self.list("restores/", params).await
    }

    async fn create_restore(&self, xfer: &RestoreTransfer) -> Result<CreateOutcome> {
        self.create("restores/", xfer).await
    }

    async fn update_restore(&self, xfer: &RestoreTransfer) -> Result<()> {
        self.update(&format!("restores/{}/", xfer.restore_id), xfer)
            .await
    }

    async fn get_work_item(&self, id: i64) -> Result<WorkItem> {
        self.get_json(&format!("work_items/{}/", id)).await
    }

    async fn list_work_items(&self, params: &ListParams) -> Result<PagedResponse<WorkItem>> {
        self.list("work_items/", params).await
    }

    async fn create_work_item(&self, item: &WorkItem) -> Result<WorkItem> {
        self.create_returning("work_items/", item).await
    }

    async fn update_work_item(&self, item: &WorkItem) -> Result<()> {
        self.update(&format!("work_items/{}/", item.id), item).await
    }
}

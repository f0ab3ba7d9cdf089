use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;

use crate::models::{Blueprint, Entity};
use crate::{Error, Result};

/// Options for an entity upsert.
///
/// `merge` keeps catalog-side fields the payload does not mention, which is
/// what makes at-least-once redelivery converge instead of clobbering.
#[derive(Debug, Clone)]
pub struct UpsertOptions {
    pub merge: bool,
    /// Create placeholder entities for relation targets that do not exist
    /// yet. Required (together with `delete_dependents`) to resolve cyclic
    /// relations explicitly.
    pub create_missing_related_entities: bool,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            merge: true,
            create_missing_related_entities: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Also delete entities whose relations point at the deleted one.
    pub delete_dependents: bool,
}

/// The catalog's remote entity surface. Storage internals are out of scope;
/// this is a network collaborator with a small request surface.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Current entity set for one blueprint.
    async fn search_entities(&self, blueprint: &str) -> Result<Vec<Entity>>;

    async fn upsert_entity(&self, entity: &Entity, options: &UpsertOptions) -> Result<()>;

    async fn delete_entity(&self, entity: &Entity, options: &DeleteOptions) -> Result<()>;

    async fn get_blueprint(&self, identifier: &str) -> Result<Blueprint>;
}

/// HTTP implementation of [`CatalogClient`].
#[derive(Debug, Clone)]
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    entities: Vec<Entity>,
}

#[derive(Deserialize)]
struct BlueprintResponse {
    blueprint: Blueprint,
}

impl HttpCatalogClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("meridian_core/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn check(resp: &reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status.as_u16() == 409 {
            return Err(Error::Conflict(format!("catalog returned {status}")));
        }
        if !status.is_success() {
            return Err(Error::CatalogNonSuccess {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn search_entities(&self, blueprint: &str) -> Result<Vec<Entity>> {
        let url = format!(
            "{}/v1/blueprints/{blueprint}/entities/search",
            self.base_url
        );
        let resp = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONTENT_TYPE, "application/json")
            .json(&serde_json::json!({ "combinator": "and", "rules": [] }))
            .send()
            .await?;
        Self::check(&resp)?;
        let body: SearchResponse = resp.json().await?;
        Ok(body.entities)
    }

    #[tracing::instrument(level = "debug", skip(self, entity), fields(blueprint = %entity.blueprint))]
    async fn upsert_entity(&self, entity: &Entity, options: &UpsertOptions) -> Result<()> {
        let url = format!(
            "{}/v1/blueprints/{}/entities",
            self.base_url, entity.blueprint
        );
        let resp = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .query(&[
                ("upsert", "true"),
                ("merge", if options.merge { "true" } else { "false" }),
                (
                    "create_missing_related_entities",
                    if options.create_missing_related_entities {
                        "true"
                    } else {
                        "false"
                    },
                ),
            ])
            .json(entity)
            .send()
            .await?;
        Self::check(&resp)
    }

    #[tracing::instrument(level = "debug", skip(self, entity), fields(blueprint = %entity.blueprint))]
    async fn delete_entity(&self, entity: &Entity, options: &DeleteOptions) -> Result<()> {
        let identifier = entity.identifier.as_literal().ok_or_else(|| {
            Error::InvalidInput("cannot delete an entity with a search identifier".to_string())
        })?;
        let url = format!(
            "{}/v1/blueprints/{}/entities/{identifier}",
            self.base_url, entity.blueprint
        );
        let resp = self
            .client
            .delete(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .query(&[(
                "delete_dependents",
                if options.delete_dependents {
                    "true"
                } else {
                    "false"
                },
            )])
            .send()
            .await?;
        Self::check(&resp)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_blueprint(&self, identifier: &str) -> Result<Blueprint> {
        let url = format!("{}/v1/blueprints/{identifier}", self.base_url);
        let resp = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await?;
        Self::check(&resp)?;
        let body: BlueprintResponse = resp.json().await?;
        Ok(body.blueprint)
    }
}

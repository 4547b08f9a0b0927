//! HTTP implementation of the broker client

use super::{
    BindRequest, BindResponse, BrokerClient, BrokerClientFactory, BrokerConfig, Catalog,
    DeprovisionRequest, OsbError, OsbResult, ProvisionRequest, UnbindRequest,
};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Protocol version sent in the `X-Broker-API-Version` header
pub const OSB_API_VERSION: &str = "2.14";

const API_VERSION_HEADER: &str = "X-Broker-API-Version";

/// Maximum error body bytes kept in error messages
const MAX_ERROR_BODY_BYTES: usize = 4096;

#[derive(Debug, Serialize)]
struct ProvisionBody<'a> {
    service_id: &'a str,
    plan_id: &'a str,
    organization_guid: &'a str,
    space_guid: &'a str,
}

#[derive(Debug, Serialize)]
struct BindBody<'a> {
    service_id: &'a str,
    plan_id: &'a str,
}

/// OSB error response body
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Service broker client speaking OSB over HTTP with basic auth
pub struct HttpBrokerClient {
    config: BrokerConfig,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBrokerClient")
            .field("name", &self.config.name)
            .field("base_url", &self.base_url)
            .field("username", &self.config.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl HttpBrokerClient {
    pub fn new(config: BrokerConfig) -> OsbResult<Self> {
        if !config.url.starts_with("https://") && !config.url.starts_with("http://") {
            return Err(OsbError::InvalidConfig(format!(
                "broker url must start with http:// or https://, got: {}",
                config.url
            )));
        }

        if config.url.starts_with("http://") {
            debug!(broker = %config.name, "Broker url uses plain HTTP");
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OsbError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        let base_url = config.url.trim_end_matches('/').to_string();

        Ok(Self {
            config,
            base_url,
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, url)
            .basic_auth(
                &self.config.username,
                Some(self.config.password.expose_secret()),
            )
            .header(API_VERSION_HEADER, OSB_API_VERSION)
    }

    /// Send a request and turn non-2xx answers into [`OsbError::Status`]
    async fn send(&self, builder: RequestBuilder) -> OsbResult<Response> {
        let response = builder.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(parse_error_response(response).await)
    }
}

/// Build a status error from a failed response, preferring the OSB
/// `description` field over the raw body.
async fn parse_error_response(response: Response) -> OsbError {
    let code = response.status().as_u16();

    let body = match response.bytes().await {
        Ok(b) => {
            if b.len() > MAX_ERROR_BODY_BYTES {
                String::from_utf8_lossy(&b[..MAX_ERROR_BODY_BYTES]).to_string()
            } else {
                String::from_utf8_lossy(&b).to_string()
            }
        }
        Err(_) => String::new(),
    };

    let description = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody {
            description: Some(description),
            ..
        }) => description,
        Ok(ErrorBody {
            error: Some(error), ..
        }) => error,
        _ if body.is_empty() => reqwest::StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("unknown error")
            .to_string(),
        _ => body,
    };

    warn!(code, description = %description, "Broker request failed");
    OsbError::Status { code, description }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn catalog(&self) -> OsbResult<Catalog> {
        debug!(broker = %self.config.name, "Fetching catalog");

        let response = self.send(self.request(Method::GET, "/v2/catalog")).await?;
        let catalog: Catalog = response.json().await?;
        Ok(catalog)
    }

    async fn provision(&self, request: &ProvisionRequest) -> OsbResult<()> {
        debug!(
            broker = %self.config.name,
            instance_id = %request.instance_id,
            "Provisioning service instance"
        );

        let path = format!("/v2/service_instances/{}", request.instance_id);
        let builder = self
            .request(Method::PUT, &path)
            .query(&[("accepts_incomplete", "false")])
            .json(&ProvisionBody {
                service_id: &request.service_id,
                plan_id: &request.plan_id,
                organization_guid: &request.organization_guid,
                space_guid: &request.space_guid,
            });
        self.send(builder).await?;
        Ok(())
    }

    async fn deprovision(&self, request: &DeprovisionRequest) -> OsbResult<()> {
        debug!(
            broker = %self.config.name,
            instance_id = %request.instance_id,
            "Deprovisioning service instance"
        );

        let path = format!("/v2/service_instances/{}", request.instance_id);
        let builder = self.request(Method::DELETE, &path).query(&[
            ("service_id", request.service_id.as_str()),
            ("plan_id", request.plan_id.as_str()),
            ("accepts_incomplete", "false"),
        ]);
        self.send(builder).await?;
        Ok(())
    }

    async fn bind(&self, request: &BindRequest) -> OsbResult<BindResponse> {
        debug!(
            broker = %self.config.name,
            instance_id = %request.instance_id,
            binding_id = %request.binding_id,
            "Creating service binding"
        );

        let path = format!(
            "/v2/service_instances/{}/service_bindings/{}",
            request.instance_id, request.binding_id
        );
        let builder = self
            .request(Method::PUT, &path)
            .query(&[("accepts_incomplete", "false")])
            .json(&BindBody {
                service_id: &request.service_id,
                plan_id: &request.plan_id,
            });
        let response = self.send(builder).await?;
        let binding: BindResponse = response.json().await?;
        Ok(binding)
    }

    async fn unbind(&self, request: &UnbindRequest) -> OsbResult<()> {
        debug!(
            broker = %self.config.name,
            instance_id = %request.instance_id,
            binding_id = %request.binding_id,
            "Deleting service binding"
        );

        let path = format!(
            "/v2/service_instances/{}/service_bindings/{}",
            request.instance_id, request.binding_id
        );
        let builder = self.request(Method::DELETE, &path).query(&[
            ("service_id", request.service_id.as_str()),
            ("plan_id", request.plan_id.as_str()),
            ("accepts_incomplete", "false"),
        ]);
        self.send(builder).await?;
        Ok(())
    }
}

/// Factory producing [`HttpBrokerClient`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpClientFactory;

impl BrokerClientFactory for HttpClientFactory {
    fn client(&self, config: BrokerConfig) -> OsbResult<Box<dyn BrokerClient>> {
        Ok(Box::new(HttpBrokerClient::new(config)?))
    }
}

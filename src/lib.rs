//! A client library for ingesting records into Supabase tables via HTTP.
//!
//! Supabase exposes Postgres tables through a PostgREST-style REST API. This
//! crate wraps the insert endpoint of that API: build a [`Client`] once, hand
//! out cheap [`Table`] handles, and push one JSON record per call.

#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]
#![warn(clippy::await_holding_lock, clippy::inefficient_to_string)]

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tracing::*;

/// A stored or to-be-stored row: field names mapped to JSON values.
pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
  #[error("HTTP status: {0}")]
  HttpStatus(StatusCode),

  #[error("RecordSerialization: {0}")]
  RecordSerialization(serde_json::Error),

  /// The server accepted the call but echoed no stored rows (a `null` or
  /// empty payload). Kept apart from [`Error::RecordSerialization`], which
  /// covers responses that are not row arrays at all.
  #[error("NoRowsStored: no rows stored in table '{table}'")]
  NoRowsStored { table: String },

  #[error("InvalidUrl: {0}")]
  InvalidUrl(url::ParseError),

  #[error("InvalidKey: {0}")]
  InvalidKey(header::InvalidHeaderValue),

  #[error("Env: missing required variable '{var}'")]
  Env { var: &'static str },

  // Catch-all; reqwest's error surface is too broad to unpack further.
  #[error("Reqwest: {0}")]
  OtherReqwest(reqwest::Error),
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    match err.status() {
      Some(code) => Self::HttpStatus(code),
      _ => Self::OtherReqwest(err),
    }
  }
}

struct ClientState {
  client: reqwest::Client,
  url: url::Url,
  headers: HeaderMap,
  site: String,
}

impl ClientState {
  async fn fetch<T: Serialize>(
    &self,
    path: &str,
    headers: HeaderMap,
    method: Method,
    body: Option<&T>,
  ) -> Result<reqwest::Response, Error> {
    assert!(path.starts_with("/"));

    let mut url = self.url.clone();
    url.set_path(path);

    let request = {
      let mut builder = self.client.request(method, url).headers(headers);
      if let Some(ref body) = body {
        let json = serde_json::to_string(body).map_err(Error::RecordSerialization)?;
        builder = builder.body(json);
      }
      builder.build()?
    };

    return Ok(self.client.execute(request).await?.error_for_status()?);
  }
}

/// Handle to a named table, obtained from [`Client::table`].
#[derive(Clone)]
pub struct Table {
  client: Arc<ClientState>,
  name: String,
}

impl Table {
  pub fn name(&self) -> &str {
    return &self.name;
  }

  /// Inserts `record` into this table and returns the stored rows echoed by
  /// the server, normally one element carrying the submitted fields plus
  /// server-assigned ones such as `id` and `created_at`.
  ///
  /// Every failure is reported through the returned [`Error`]: transport
  /// problems, non-2xx statuses (an empty or unknown table name is rejected
  /// server-side), and 2xx responses that echo no stored rows. One `tracing`
  /// event is emitted per call either way; it is diagnostic only.
  ///
  /// There is no retry and no idempotency key: inserting the same record
  /// twice stores two rows unless the table itself enforces uniqueness.
  pub async fn insert<T: Serialize>(&self, record: &T) -> Result<Vec<Record>, Error> {
    let result = self.insert_impl(record).await;
    match result {
      Ok(ref rows) => {
        info!(
          "Insertion successful in table '{name}': {rows}",
          name = self.name,
          rows = serde_json::to_string(rows).unwrap_or_default(),
        );
      }
      Err(ref err) => {
        warn!("Error inserting into table '{name}': {err}", name = self.name);
      }
    }
    return result;
  }

  async fn insert_impl<T: Serialize>(&self, record: &T) -> Result<Vec<Record>, Error> {
    let mut headers = self.client.headers.clone();
    headers.insert("Prefer", HeaderValue::from_static("return=representation"));

    let response = self
      .client
      .fetch(
        &format!("/{REST_API}/{name}", name = self.name),
        headers,
        Method::POST,
        Some(record),
      )
      .await?;

    let rows: Option<Vec<Record>> = json(response).await?;
    return match rows {
      Some(rows) if !rows.is_empty() => Ok(rows),
      _ => Err(Error::NoRowsStored {
        table: self.name.clone(),
      }),
    };
  }
}

/// Connection handle to a Supabase project. Built once, cloned freely; all
/// state is immutable after construction, so concurrent use needs no locking.
#[derive(Clone)]
pub struct Client {
  state: Arc<ClientState>,
}

impl Client {
  pub fn new(site: &str, key: &str) -> Result<Client, Error> {
    return Ok(Client {
      state: Arc::new(ClientState {
        client: reqwest::Client::new(),
        url: url::Url::parse(site).map_err(Error::InvalidUrl)?,
        headers: build_headers(key)?,
        site: site.to_string(),
      }),
    });
  }

  /// Builds a client from the [`SITE_ENV_VAR`] and [`KEY_ENV_VAR`]
  /// environment variables. Either one missing is an [`Error::Env`].
  pub fn from_env() -> Result<Client, Error> {
    return from_env_with(|var| std::env::var(var).ok());
  }

  pub fn site(&self) -> String {
    return self.state.site.clone();
  }

  pub fn table(&self, name: &str) -> Table {
    return Table {
      client: self.state.clone(),
      name: name.to_string(),
    };
  }
}

fn from_env_with(get: impl Fn(&'static str) -> Option<String>) -> Result<Client, Error> {
  let site = get(SITE_ENV_VAR).ok_or(Error::Env { var: SITE_ENV_VAR })?;
  let key = get(KEY_ENV_VAR).ok_or(Error::Env { var: KEY_ENV_VAR })?;
  return Client::new(&site, &key);
}

fn build_headers(key: &str) -> Result<HeaderMap, Error> {
  let mut base = HeaderMap::with_capacity(3);
  base.insert(
    header::CONTENT_TYPE,
    HeaderValue::from_static("application/json"),
  );

  // Supabase wants the key both as `apikey` and as a bearer token.
  base.insert("apikey", HeaderValue::from_str(key).map_err(Error::InvalidKey)?);
  base.insert(
    header::AUTHORIZATION,
    HeaderValue::from_str(&format!("Bearer {key}")).map_err(Error::InvalidKey)?,
  );

  return Ok(base);
}

#[inline]
async fn json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
  let full = resp.bytes().await?;
  return serde_json::from_slice(&full).map_err(Error::RecordSerialization);
}

const REST_API: &str = "rest/v1";

/// Environment variable naming the project endpoint URL.
pub const SITE_ENV_VAR: &str = "SUPABASE_URL";
/// Environment variable holding the service key.
pub const KEY_ENV_VAR: &str = "SUPABASE_KEY";

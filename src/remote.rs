//! [`Backend`] over the record server's HTTP API (blocking reqwest).

use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::client::Backend;
use crate::error::{DbError, Result};
use crate::models::{Batch, Bin, CursorId, IndexSpec, Key, Record, Statement, TaskStatus, UdfCall};
use crate::rest::{
    AggregateRest, CursorOpened, DeleteResponse, ErrorBody, InfoResponse, PutRecordRest, RegisterUdfRest,
    RestResponse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RemoteBackend {
    http: HttpClient,
    base_url: Url,
}

impl RemoteBackend {
    /// Connect to `host:port` and check `/health` so an unreachable server
    /// fails here rather than on the first operation.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| DbError::Connection(e.to_string()))?;
        let base_url = Url::parse(&format!("http://{host}:{port}"))
            .map_err(|e| DbError::Connection(format!("{host}:{port}: {e}")))?;
        let backend = Self { http, base_url };
        let health: RestResponse = backend
            .send(backend.http.get(backend.url(&["health"])?))
            .map_err(|e| DbError::Connection(format!("{}: {e}", backend.base_url)))?;
        debug!(server = %backend.base_url, message = %health.message, "connected");
        Ok(backend)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Server URL for a path. Each segment is percent-encoded, so names may
    /// carry `/`, `#` or `?`.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DbError::Connection(format!("{} cannot carry a path", self.base_url)))?
            .clear()
            .extend(segments);
        Ok(url)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json()?);
        }
        match response.json::<ErrorBody>() {
            Ok(body) => Err(DbError::Remote {
                code: body.code,
                message: body.message,
            }),
            Err(_) => Err(DbError::Protocol(format!("server answered {status} without an error body"))),
        }
    }
}

impl Backend for RemoteBackend {
    fn register_udf(&self, file_name: &str, source: &str) -> Result<()> {
        let body = RegisterUdfRest {
            file_name: file_name.to_string(),
            source: source.to_string(),
        };
        self.send::<RestResponse>(self.http.post(self.url(&["udfs"])?).json(&body))?;
        Ok(())
    }

    fn udf_status(&self, file_name: &str) -> Result<TaskStatus> {
        self.send(self.http.get(self.url(&["udfs", file_name])?))
    }

    fn remove_udf(&self, file_name: &str) -> Result<()> {
        self.send::<RestResponse>(self.http.delete(self.url(&["udfs", file_name])?))?;
        Ok(())
    }

    fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        self.send::<RestResponse>(self.http.post(self.url(&["indexes"])?).json(spec))?;
        Ok(())
    }

    fn index_status(&self, namespace: &str, name: &str) -> Result<TaskStatus> {
        self.send(self.http.get(self.url(&["indexes", namespace, name])?))
    }

    fn drop_index(&self, namespace: &str, name: &str) -> Result<()> {
        self.send::<RestResponse>(self.http.delete(self.url(&["indexes", namespace, name])?))?;
        Ok(())
    }

    fn put(&self, key: &Key, bins: &[Bin]) -> Result<()> {
        let body = PutRecordRest {
            key: key.clone(),
            bins: bins.to_vec(),
        };
        self.send::<RestResponse>(self.http.post(self.url(&["records"])?).json(&body))?;
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<Record>> {
        self.send(self.http.post(self.url(&["records", "get"])?).json(key))
    }

    fn delete(&self, key: &Key) -> Result<bool> {
        let response: DeleteResponse = self.send(self.http.post(self.url(&["records", "delete"])?).json(key))?;
        Ok(response.existed)
    }

    fn open_query(&self, stmt: &Statement) -> Result<CursorId> {
        let opened: CursorOpened = self.send(self.http.post(self.url(&["queries"])?).json(stmt))?;
        Ok(opened.cursor)
    }

    fn open_aggregate(&self, stmt: &Statement, call: &UdfCall) -> Result<CursorId> {
        let body = AggregateRest {
            statement: stmt.clone(),
            call: call.clone(),
        };
        let opened: CursorOpened = self.send(self.http.post(self.url(&["aggregates"])?).json(&body))?;
        Ok(opened.cursor)
    }

    fn fetch(&self, cursor: CursorId, max: usize) -> Result<Batch> {
        let id = cursor.to_string();
        let mut url = self.url(&["cursors", id.as_str()])?;
        url.query_pairs_mut().append_pair("max", &max.to_string());
        self.send(self.http.get(url))
    }

    fn close_cursor(&self, cursor: CursorId) -> Result<()> {
        let id = cursor.to_string();
        self.send::<RestResponse>(self.http.delete(self.url(&["cursors", id.as_str()])?))?;
        Ok(())
    }

    fn info(&self, command: &str) -> Result<String> {
        let info: InfoResponse = self.send(self.http.get(self.url(&["info", command])?))?;
        Ok(info.response)
    }
}

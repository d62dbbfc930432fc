//! HTTP transport against a live server.
//!
//! Each [`Operation`] is one request against either the repository URL
//! (shared access) or a session URL. Statements travel as JSON arrays of
//! `[subject, predicate, object]` or `[subject, predicate, object, graph]`.
//!
//! Masquerading is a request header, not server state, so the transport
//! remembers the masquerade user per session URL and attaches it to every
//! later request for that session.

use super::{
    Endpoint, Naming, OpenSession, Operation, Reply, RepositoryRef, Statement, Transport,
    TransportError,
};
use crate::config::ServerConfig;
use crate::overlay::DuplicateSuppression;
use dashmap::DashMap;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use std::time::Duration;

const MASQUERADE_HEADER: &str = "x-masquerade-as-user";

/// Blocking reqwest transport with basic auth
pub struct HttpTransport {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    masquerade: DashMap<String, String>,
}

impl HttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Self, TransportError> {
        let timeout =
            (config.http_timeout_ms > 0).then(|| Duration::from_millis(config.http_timeout_ms));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable {
                endpoint: config.url.clone(),
                message: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(HttpTransport {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            masquerade: DashMap::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, url: &str, session: Option<&str>) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if !self.username.is_empty() {
            builder = builder.basic_auth(&self.username, Some(&self.password));
        }
        if let Some(user) = session.and_then(|s| self.masquerade.get(s)) {
            builder = builder.header(MASQUERADE_HEADER, user.value().as_str());
        }
        builder
    }

    /// Send and classify the response. `session` marks requests whose
    /// target may vanish when the session expires. A refused connection
    /// only means the session is gone when it had its own port; through the
    /// main port it means the server is unreachable.
    fn send(&self, builder: RequestBuilder, session: Option<&str>) -> Result<Response, TransportError> {
        let response = builder.send().map_err(|e| match session {
            Some(url) if e.is_connect() && !routed_through_main_port(url) => {
                TransportError::SessionGone {
                    url: url.to_string(),
                }
            }
            _ => TransportError::Unreachable {
                endpoint: e.url().map_or_else(String::new, ToString::to_string),
                message: e.to_string(),
            },
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().unwrap_or_default();
        Err(match (status, session) {
            (StatusCode::NOT_FOUND, Some(session)) => TransportError::SessionGone {
                url: session.to_string(),
            },
            (StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY, _) => {
                TransportError::Rejected {
                    status: status.as_u16(),
                    message: body,
                }
            }
            _ => TransportError::Unreachable {
                endpoint: url,
                message: format!("{status}: {body}"),
            },
        })
    }

    fn text(response: Response) -> Result<String, TransportError> {
        response
            .text()
            .map(|body| body.trim().to_string())
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    fn count(response: Response) -> Result<u64, TransportError> {
        let body = Self::text(response)?;
        body.parse()
            .map_err(|_| TransportError::Protocol(format!("expected a number, got '{body}'")))
    }

    fn flag(response: Response) -> Result<bool, TransportError> {
        match Self::text(response)?.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(TransportError::Protocol(format!(
                "expected true or false, got '{other}'"
            ))),
        }
    }

    fn contains_request(
        &self,
        root: &str,
        session: Option<&str>,
        statement: &Statement,
    ) -> RequestBuilder {
        let mut query = vec![
            ("subj", statement.subject.as_str()),
            ("pred", statement.predicate.as_str()),
            ("obj", statement.object.as_str()),
            ("limit", "1"),
        ];
        if let Some(graph) = &statement.graph {
            query.push(("context", graph.as_str()));
        }
        self.request(Method::GET, &format!("{root}/statements"), session)
            .query(&query)
            .header("accept", "application/json")
    }

    /// Masquerade changes are validated with a ping carrying the new header
    fn set_masquerade(&self, session: &str, user: Option<&str>) -> Result<Reply, TransportError> {
        let previous = match user {
            Some(user) => self.masquerade.insert(session.to_string(), user.to_string()),
            None => self.masquerade.remove(session).map(|(_, user)| user),
        };
        let check = self.request(Method::GET, &format!("{session}/session/ping"), Some(session));
        if let Err(e) = self.send(check, Some(session)) {
            match previous {
                Some(previous) => self.masquerade.insert(session.to_string(), previous),
                None => self.masquerade.remove(session).map(|(_, user)| user),
            };
            return Err(e);
        }
        Ok(Reply::Done)
    }
}

fn statements_json(statements: &[Statement]) -> serde_json::Value {
    serde_json::Value::Array(
        statements
            .iter()
            .map(|s| {
                let mut parts = vec![s.subject.clone(), s.predicate.clone(), s.object.clone()];
                if let Some(graph) = &s.graph {
                    parts.push(graph.clone());
                }
                serde_json::json!(parts)
            })
            .collect(),
    )
}

fn routed_through_main_port(session_url: &str) -> bool {
    session_url.contains("/session/")
}

/// Rewrite a session URL between the dedicated-port and main-port forms.
///
/// - `use_main_port` and a dedicated URL `http://host:<port>/rest` becomes
///   `<repo_root>/session/<port>/rest`
/// - `!use_main_port && override_server` and a main-port URL
///   `http://host:<main>/.../session/<port>/rest` becomes `http://host:<port>/rest`
/// - anything else is returned unchanged
pub fn adjust_session_url(
    session_url: &str,
    repo_root: &str,
    use_main_port: bool,
    override_server: bool,
) -> Result<String, TransportError> {
    let uses_main_port = routed_through_main_port(session_url);
    if use_main_port && !uses_main_port {
        let tail = session_url
            .rfind(':')
            .map(|i| &session_url[i + 1..])
            .ok_or_else(|| TransportError::Protocol(format!("no port in session url {session_url}")))?;
        let port = tail.split('/').next().unwrap_or_default();
        if port.is_empty() || port.parse::<u16>().is_err() {
            return Err(TransportError::Protocol(format!(
                "problem finding port in session url: {tail}"
            )));
        }
        return Ok(format!("{repo_root}/session/{tail}"));
    }
    if !use_main_port && uses_main_port && override_server {
        let main_port_start = session_url
            .rfind(':')
            .map(|i| i + 1)
            .ok_or_else(|| TransportError::Protocol(format!("no port in session url {session_url}")))?;
        let marker = session_url
            .find("/session/")
            .ok_or_else(|| TransportError::Protocol(format!("malformed session url {session_url}")))?;
        let port_start = marker + "/session/".len();
        let port_end = session_url[port_start..]
            .find('/')
            .map_or(session_url.len(), |i| port_start + i);
        let port = &session_url[port_start..port_end];
        if port.parse::<u16>().is_err() {
            return Err(TransportError::Protocol(format!(
                "problem finding port in session url: {session_url}"
            )));
        }
        return Ok(format!(
            "{}{}{}",
            &session_url[..main_port_start],
            port,
            &session_url[port_end..]
        ));
    }
    Ok(session_url.to_string())
}

impl Transport for HttpTransport {
    fn open_session(
        &self,
        repository: &RepositoryRef,
        params: &OpenSession,
    ) -> Result<String, TransportError> {
        let url = format!(
            "{}/session?lifetime={}&autoCommit={}",
            repository.url, params.lifetime_secs, params.auto_commit
        );
        let response = self.send(self.request(Method::POST, &url, None), None)?;
        let body = Self::text(response)?;
        let session_url = body.trim_matches('"').to_string();
        if session_url.is_empty() {
            return Err(TransportError::Protocol("empty session url".to_string()));
        }
        Ok(session_url)
    }

    fn invoke(&self, endpoint: Endpoint<'_>, op: &Operation) -> Result<Reply, TransportError> {
        let (root, session) = match endpoint {
            Endpoint::Shared(repo) => (repo.url.as_str(), None),
            Endpoint::Session(url) => (url, Some(url)),
        };
        if op.requires_session() && session.is_none() {
            return Err(TransportError::Rejected {
                status: 400,
                message: format!("{} requires a session", op.name()),
            });
        }
        let req = |method: Method, path: &str| self.request(method, &format!("{root}{path}"), session);

        match op {
            Operation::Size => Self::count(self.send(req(Method::GET, "/size"), session)?).map(Reply::Count),
            Operation::Add {
                statements,
                commit_every,
            } => {
                let path = if *commit_every > 0 {
                    format!("/statements?commit={commit_every}")
                } else {
                    "/statements".to_string()
                };
                self.send(req(Method::POST, &path).json(&statements_json(statements)), session)?;
                Ok(Reply::Done)
            }
            Operation::Remove(statements) => {
                self.send(
                    req(Method::POST, "/statements/delete").json(&statements_json(statements)),
                    session,
                )?;
                Ok(Reply::Done)
            }
            Operation::Clear => {
                self.send(req(Method::DELETE, "/statements"), session)?;
                Ok(Reply::Done)
            }
            Operation::Contains(statement) => {
                let response = self.send(self.contains_request(root, session, statement), session)?;
                let rows: Vec<serde_json::Value> = response
                    .json()
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                Ok(Reply::Flag(!rows.is_empty()))
            }
            Operation::Commit => {
                self.send(req(Method::POST, "/commit"), session)?;
                Ok(Reply::Done)
            }
            Operation::Rollback => {
                self.send(req(Method::POST, "/rollback"), session)?;
                Ok(Reply::Done)
            }
            Operation::SetAutoCommit(on) => {
                self.send(req(Method::POST, &format!("/session/autoCommit?on={on}")), session)?;
                Ok(Reply::Done)
            }
            Operation::BlankNodes(amount) => {
                let body = Self::text(self.send(
                    req(Method::POST, &format!("/blankNodes?amount={amount}")),
                    session,
                )?)?;
                Ok(Reply::Identifiers(
                    body.lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(str::to_string)
                        .collect(),
                ))
            }
            Operation::SetMasquerade(user) => match session {
                Some(session) => self.set_masquerade(session, user.as_deref()),
                None => Ok(Reply::Done),
            },
            Operation::SetTripleCache(0) => {
                self.send(req(Method::DELETE, "/tripleCache"), session)?;
                Ok(Reply::Done)
            }
            Operation::SetTripleCache(size) => {
                self.send(req(Method::PUT, &format!("/tripleCache?size={size}")), session)?;
                Ok(Reply::Done)
            }
            Operation::TripleCacheSize => {
                let body = Self::text(self.send(req(Method::GET, "/tripleCache"), session)?)?;
                if body == "false" {
                    return Ok(Reply::Count(0));
                }
                body.parse()
                    .map(Reply::Count)
                    .map_err(|_| TransportError::Protocol(format!("bad triple cache size '{body}'")))
            }
            Operation::SetBulkMode(on) => {
                let method = if *on { Method::PUT } else { Method::DELETE };
                self.send(req(method, "/bulkMode"), session)?;
                Ok(Reply::Done)
            }
            Operation::BulkMode => Self::flag(self.send(req(Method::GET, "/bulkMode"), session)?).map(Reply::Flag),
            Operation::SetDuplicateSuppression(policy) => {
                let builder = match policy {
                    DuplicateSuppression::Off => req(Method::DELETE, "/suppressDuplicates"),
                    other => req(Method::PUT, &format!("/suppressDuplicates?type={other}")),
                };
                self.send(builder, session)?;
                Ok(Reply::Done)
            }
            Operation::DuplicateSuppression => {
                Self::text(self.send(req(Method::GET, "/suppressDuplicates"), session)?).map(Reply::Text)
            }
            Operation::DeleteDuplicates(mode) => {
                self.send(
                    req(Method::DELETE, &format!("/statements/duplicates?mode={mode}")),
                    session,
                )?;
                Ok(Reply::Done)
            }
        }
    }

    fn ping(&self, session_url: &str) -> Result<(), TransportError> {
        let url = format!("{session_url}/session/ping");
        self.send(self.request(Method::GET, &url, Some(session_url)), Some(session_url))?;
        Ok(())
    }

    fn close_session(&self, session_url: &str) -> Result<(), TransportError> {
        let url = format!("{session_url}/session/close");
        let result = self.send(
            self.request(Method::POST, &url, Some(session_url)),
            Some(session_url),
        );
        self.masquerade.remove(session_url);
        result.map(|_| ())
    }
}

impl Naming for HttpTransport {
    fn resolve(&self, catalog: Option<&str>, repository: &str) -> RepositoryRef {
        let url = match catalog {
            Some(catalog) => format!("{}/catalogs/{catalog}/repositories/{repository}", self.base_url),
            None => format!("{}/repositories/{repository}", self.base_url),
        };
        RepositoryRef {
            catalog: catalog.map(str::to_string),
            name: repository.to_string(),
            url,
        }
    }

    fn has_repository(
        &self,
        catalog: Option<&str>,
        repository: &str,
    ) -> Result<bool, TransportError> {
        Ok(self.list_repositories(catalog)?.iter().any(|name| name == repository))
    }

    fn create_repository(
        &self,
        catalog: Option<&str>,
        repository: &str,
    ) -> Result<RepositoryRef, TransportError> {
        let repo = self.resolve(catalog, repository);
        let url = format!("{}?override=false", repo.url);
        match self.send(self.request(Method::PUT, &url, None), None) {
            Ok(_) => Ok(repo),
            Err(e @ TransportError::Rejected { .. }) => {
                // already exists
                if self.has_repository(catalog, repository)? {
                    Ok(repo)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn delete_repository(
        &self,
        catalog: Option<&str>,
        repository: &str,
    ) -> Result<(), TransportError> {
        let repo = self.resolve(catalog, repository);
        self.send(self.request(Method::DELETE, &repo.url, None), None)?;
        Ok(())
    }

    fn list_repositories(&self, catalog: Option<&str>) -> Result<Vec<String>, TransportError> {
        let url = match catalog {
            Some(catalog) => format!("{}/catalogs/{catalog}/repositories", self.base_url),
            None => format!("{}/repositories", self.base_url),
        };
        let response = self.send(
            self.request(Method::GET, &url, None).header("accept", "application/json"),
            None,
        )?;
        let entries: Vec<serde_json::Value> = response
            .json()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let mut names: Vec<String> = entries
            .iter()
            .filter_map(|entry| entry.get("id").and_then(|id| id.as_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

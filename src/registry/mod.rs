
mod tls;

use std::{cell::RefCell, io::Read, net::SocketAddr, str::FromStr, sync::Arc};

use crate::{credentials::CredentialSource, digest::Digest, EventHandler, Reference};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("{0}")]
    Client(#[from] Box<ureq::Error>),

    #[error("Missing authentication tokens.")]
    MissingTokens,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to configure TLS: {0}")]
    Tls(#[from] rustls::Error),
}

impl From<ureq::Error> for HttpError {
    fn from(value: ureq::Error) -> Self {
        HttpError::Client(Box::new(value))
    }
}

/// How to connect to the registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct Transport {
    /// Use plain HTTP.
    pub insecure: bool,

    /// Accept any TLS certificate from the registry.
    pub skip_tls_verify: bool,
}

pub(crate) struct Client<'a, E> {
    agent: ureq::Agent,
    event_handler: &'a E,
    credentials: Option<String>,
    authorization: RefCell<Option<String>>,
    base_url: String,
}

impl<'a, E> Client<'a, E>
where
    E: EventHandler,
{
    /// Create a new HTTP client to the registry/image in `reference`.
    ///
    /// The URI scheme is `http://` if `transport.insecure` is set.
    /// Otherwise, it is guessed from the address of the registry:
    ///
    /// * If it is `localhost` or a loopback IP (like `127.0.0.1`), or
    ///   if the port is `:80`, it uses `http://`.
    /// * In any other case, it uses `https://`.
    pub fn new(
        reference: &Reference,
        transport: Transport,
        credentials: &dyn CredentialSource,
        event_handler: &'a E,
    ) -> Result<Self, HttpError> {
        let mut agent = ureq::AgentBuilder::new().user_agent(USER_AGENT);

        if transport.skip_tls_verify {
            agent = agent.tls_config(Arc::new(tls::accept_any_certificate()?));
        }

        let scheme = if transport.insecure {
            "http://"
        } else {
            guess_scheme(reference.registry)
        };

        Ok(Client {
            agent: agent.build(),
            event_handler,
            credentials: credentials.basic_auth(reference.registry),
            authorization: RefCell::default(),
            base_url: format!(
                "{scheme}{}/v2/{}",
                reference.registry, reference.repository
            ),
        })
    }

    /// Send a `GET` request to the registry.
    ///
    /// The path must not include the `v2/$image` prefix.
    pub fn get(&self, path: &str, accept: Option<&str>) -> Result<ureq::Response, HttpError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.agent.get(&url);
        if let Some(accept) = accept {
            request = request.set("Accept", accept);
        }

        self.send(request)
    }

    /// Send a `GET` request to download a blob.
    ///
    /// The returned reader fails if the data does not match `blob`.
    pub fn download_blob(&self, blob: &Digest) -> Result<Box<dyn Read>, HttpError> {
        let response = self.get(&format!("blobs/{}", blob.source()), None)?;
        Ok(Box::new(blob.wrap_reader(response.into_reader())))
    }

    /// Send a request to the registry.
    ///
    /// If it responds with a `401` error, follow the challenge in the
    /// `WWW-Authenticate` header, and repeat the request.
    fn send(&self, request: ureq::Request) -> Result<ureq::Response, HttpError> {
        self.event_handler.registry_request(request.url());

        if let Some(auth) = self.authorization.borrow().as_deref() {
            return Ok(request.set("Authorization", auth).call()?);
        }

        // Try a request with no authorization.

        let response = match request.clone().call() {
            Ok(r) => return Ok(r),
            Err(ureq::Error::Status(401, r)) => r,
            Err(e) => return Err(e.into()),
        };

        let challenge = response
            .header("www-authenticate")
            .unwrap_or_default()
            .to_owned();

        let authorization = if let Some(params) = challenge.strip_prefix("Bearer ") {
            // The response from the `realm` URL must include either
            // `token` or `access_token`.

            let Some(mut auth_request) = build_auth_request(&self.agent, params) else {
                return Err(ureq::Error::Status(401, response).into());
            };

            if let Some(credentials) = &self.credentials {
                auth_request = auth_request.set("Authorization", &format!("Basic {credentials}"));
            }

            self.event_handler.registry_auth(auth_request.url());

            #[derive(serde::Deserialize, Debug)]
            struct Tokens {
                token: Option<String>,
                access_token: Option<String>,
            }

            match serde_json::from_reader(auth_request.call()?.into_reader())? {
                Tokens { token: Some(t), .. } | Tokens {
                    access_token: Some(t),
                    ..
                } if !t.is_empty() => format!("Bearer {t}"),

                _ => return Err(HttpError::MissingTokens),
            }
        } else {
            match &self.credentials {
                Some(credentials) if challenge.starts_with("Basic") => {
                    format!("Basic {credentials}")
                }

                _ => return Err(ureq::Error::Status(401, response).into()),
            }
        };

        *self.authorization.borrow_mut() = Some(authorization);

        // Repeat the request, now that we have an authorization.
        self.send(request)
    }
}

fn guess_scheme(registry: &str) -> &'static str {
    const HTTP: &str = "http://";
    const HTTPS: &str = "https://";

    if registry.ends_with(":80") {
        return HTTP;
    }

    if registry.split_once(':').map_or(registry, |(host, _)| host) == "localhost" {
        return HTTP;
    }

    if let Ok(address) = SocketAddr::from_str(registry) {
        return if address.ip().is_loopback() {
            HTTP
        } else {
            HTTPS
        };
    }

    HTTPS
}

/// Parse the parameters of a `Bearer` challenge and build the request
/// to get the authentication token.
///
/// Return `None` if the parameters can't be parsed.
///
/// See <https://distribution.github.io/distribution/spec/auth/token/>
/// for more details.
fn build_auth_request(agent: &ureq::Agent, params: &str) -> Option<ureq::Request> {
    let mut request = None;
    let mut pending_params = vec![];
    let mut tail = params;

    loop {
        let (key, value) = tail.split_once('=')?;
        let key = key.trim_ascii();
        let (value, after) = value.strip_prefix('"')?.split_once('"')?;

        if key == "realm" {
            request = Some(
                pending_params
                    .drain(..)
                    .fold(agent.get(value), |r, (k, v)| r.query(k, v)),
            );
        } else {
            match request.take() {
                Some(r) => request = Some(r.query(key, value)),
                None => pending_params.push((key, value)),
            }
        }

        tail = match after.trim_ascii_start() {
            "" => return request,
            t => t.strip_prefix(',')?,
        };
    }
}

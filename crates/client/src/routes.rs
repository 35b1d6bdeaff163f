//! Mapping between API paths and offline semantics.

use reqwest::Method;
use serde_json::{Map, Value};
use thiserror::Error;

use tillpoint_core::{Action, OperationKind, Resource};

use crate::transport::ApiRequest;

/// Path prefixes that are never served offline.
pub const AUTH_PREFIXES: [&str; 3] = ["/auth", "/login", "/logout"];

/// What an API call means to the offline layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A read answerable from the local store.
    Read {
        resource: Resource,
        id: Option<String>,
    },
    /// A mutation that can be deferred.
    Mutation {
        kind: OperationKind,
        id: Option<String>,
    },
    Unmapped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("{kind} payload has no `id`")]
    MissingId { kind: OperationKind },
}

pub fn is_auth_path(path: &str) -> bool {
    let path = strip_query(path);
    AUTH_PREFIXES.iter().any(|prefix| {
        path == *prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Classify a call by verb and path (`/<resource>` or `/<resource>/<id>`).
pub fn classify(method: &Method, path: &str) -> Route {
    let segments: Vec<&str> = strip_query(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let (resource, id) = match segments.as_slice() {
        [resource] => (Resource::from_path_segment(resource), None),
        [resource, id] => (Resource::from_path_segment(resource), Some((*id).to_string())),
        _ => return Route::Unmapped,
    };
    let Some(resource) = resource else {
        return Route::Unmapped;
    };

    let action = match (method, id.is_some()) {
        (&Method::GET, _) if resource.is_cacheable() => return Route::Read { resource, id },
        (&Method::POST, false) => Action::Create,
        (&Method::PUT | &Method::PATCH, true) => Action::Update,
        (&Method::DELETE, true) => Action::Delete,
        _ => return Route::Unmapped,
    };

    Route::Mutation {
        kind: OperationKind::new(action, resource),
        id,
    }
}

/// Build the replay request for a queued operation.
///
/// CREATE posts to the collection; UPDATE and DELETE target `/<res>/<id>`
/// with the id taken from the payload.
pub fn dispatch_request(kind: OperationKind, payload: &Value) -> Result<ApiRequest, RouteError> {
    let segment = kind.resource.path_segment();

    if !kind.action.targets_existing() {
        return Ok(ApiRequest::post(format!("/{segment}"), payload.clone()));
    }

    let id = payload
        .get("id")
        .and_then(crate::types::entity_key)
        .ok_or(RouteError::MissingId { kind })?;
    let path = format!("/{segment}/{id}");

    Ok(match kind.action {
        Action::Update => ApiRequest::put(path, payload.clone()),
        _ => ApiRequest::delete(path),
    })
}

/// Payload to persist for a deferred mutation: the request body with the
/// path id merged in as `id`.
pub fn queued_payload(body: Option<&Value>, id: Option<&str>) -> Value {
    let mut map = match body {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other.clone());
            map
        }
    };
    if let Some(id) = id {
        map.insert("id".to_string(), Value::String(id.to_string()));
    }
    Value::Object(map)
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}

//! In-memory API server backing the unit tests.
//!
//! Requests from a real `kube::Client` are answered from a map of objects
//! keyed by their REST path, which is enough to drive whole reconcile passes
//! and inspect what they wrote.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};

use http::{Method, Request, Response, StatusCode};
use hyper::Body;
use kube::Client;
use serde_json::{json, Value};
use tower_test::mock;

#[derive(Default)]
struct Store {
    objects: BTreeMap<String, Value>,
    groups: Vec<String>,
    failures: VecDeque<(Method, String, u16)>,
    requests: Vec<(Method, String)>,
    revision: u64,
}

#[derive(Clone, Default)]
pub struct FakeApiServer {
    store: Arc<Mutex<Store>>,
}

impl FakeApiServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the given API groups from discovery, each with version `v1`
    pub fn with_api_groups(self, groups: &[&str]) -> Self {
        self.store.lock().unwrap().groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_cluster_version(self, version: &str) -> Self {
        self.insert(
            "/apis/config.openshift.io/v1/clusterversions/version",
            json!({
                "apiVersion": "config.openshift.io/v1",
                "kind": "ClusterVersion",
                "metadata": { "name": "version" },
                "spec": { "channel": "stable" },
                "status": { "desired": { "version": version } }
            }),
        );
        self
    }

    /// A cluster as the operator normally finds it: console present, the
    /// monitoring and dashboard namespaces created, an `admin` role defined
    pub fn openshift(version: &str) -> Self {
        let server = Self::new()
            .with_api_groups(&[
                "apps",
                "config.openshift.io",
                "console.openshift.io",
                "monitoring.coreos.com",
                "route.openshift.io",
            ])
            .with_cluster_version(version);

        server.insert_namespace("openshift-config-managed");
        server.insert(
            "/apis/rbac.authorization.k8s.io/v1/clusterroles/admin",
            json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRole",
                "metadata": { "name": "admin" },
                "rules": [{ "apiGroups": [""], "resources": ["pods"], "verbs": ["*"] }]
            }),
        );
        server
    }

    pub fn insert_namespace(&self, name: &str) {
        self.insert(
            &format!("/api/v1/namespaces/{name}"),
            json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": name }
            }),
        );
    }

    /// Store an object as if it had been created by someone else
    pub fn insert(&self, path: &str, mut object: Value) {
        let mut store = self.store.lock().unwrap();
        store.revision += 1;
        object["metadata"]["resourceVersion"] = json!(store.revision.to_string());
        object["metadata"]["uid"] = json!(format!("uid-{}", store.revision));
        store.objects.insert(path.to_string(), object);
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.store.lock().unwrap().objects.get(path).cloned()
    }

    /// Overwrite part of a stored object, bumping its resource version
    pub fn edit(&self, path: &str, patch: Value) {
        let mut store = self.store.lock().unwrap();
        store.revision += 1;
        let revision = store.revision.to_string();
        if let Some(object) = store.objects.get_mut(path) {
            merge(object, &patch);
            object["metadata"]["resourceVersion"] = json!(revision);
        }
    }

    pub fn remove(&self, path: &str) -> Option<Value> {
        self.store.lock().unwrap().objects.remove(path)
    }

    /// Answer the next `method` request on `path` with an error status
    pub fn fail_once(&self, method: Method, path: &str, code: u16) {
        self.store
            .lock()
            .unwrap()
            .failures
            .push_back((method, path.to_string(), code));
    }

    /// Paths of every object stored under a collection
    pub fn list(&self, collection: &str) -> Vec<String> {
        let prefix = format!("{collection}/");
        self.store
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|k| k.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/')))
            .cloned()
            .collect()
    }

    /// Number of requests with `method` seen so far
    pub fn count(&self, method: Method) -> usize {
        self.store
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(m, _)| *m == method)
            .count()
    }

    /// Spawn the request handler and hand out a client talking to it
    pub fn start(&self) -> Client {
        let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
        let server = self.clone();

        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                let response = server.handle(request).await;
                send.send_response(response);
            }
        });

        Client::new(service, "default")
    }

    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let method = request.method().clone();
        let path = request.uri().path().trim_end_matches('/').to_string();
        let body = hyper::body::to_bytes(request.into_body())
            .await
            .unwrap_or_default();
        let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

        let mut store = self.store.lock().unwrap();
        store.requests.push((method.clone(), path.clone()));

        if let Some(at) = store
            .failures
            .iter()
            .position(|(m, p, _)| *m == method && *p == path)
        {
            let (_, _, code) = store.failures.remove(at).unwrap_or((method, path, 500));
            return status(code, "injected failure");
        }

        if path == "/apis" {
            return respond(StatusCode::OK, discovery(&store.groups));
        }

        let is_collection = match resource_segments(&path) {
            Some(n) => n % 2 == 1,
            None => return status(404, "unknown path"),
        };

        match (method, is_collection) {
            (Method::GET, true) => {
                let prefix = format!("{path}/");
                let items: Vec<Value> = store
                    .objects
                    .iter()
                    .filter(|(k, _)| k.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/')))
                    .map(|(_, v)| v.clone())
                    .collect();
                respond(
                    StatusCode::OK,
                    json!({
                        "apiVersion": "v1",
                        "kind": "List",
                        "metadata": { "resourceVersion": store.revision.to_string() },
                        "items": items,
                    }),
                )
            }

            (Method::GET, false) => match store.objects.get(&path) {
                Some(object) => respond(StatusCode::OK, object.clone()),
                None => status(404, "not found"),
            },

            (Method::POST, true) => {
                let Some(name) = body["metadata"]["name"].as_str() else {
                    return status(422, "metadata.name is required");
                };
                let key = format!("{path}/{name}");
                if store.objects.contains_key(&key) {
                    return status(409, "already exists");
                }

                let mut object = body.clone();
                store.revision += 1;
                object["metadata"]["resourceVersion"] = json!(store.revision.to_string());
                object["metadata"]["uid"] = json!(format!("uid-{}", store.revision));
                store.objects.insert(key, object.clone());
                respond(StatusCode::CREATED, object)
            }

            (Method::PUT, false) => {
                let Some(current) = store.objects.get(&path) else {
                    return status(404, "not found");
                };
                let sent = &body["metadata"]["resourceVersion"];
                if !sent.is_null() && *sent != current["metadata"]["resourceVersion"] {
                    return status(409, "the object has been modified");
                }

                let uid = current["metadata"]["uid"].clone();
                let mut object = body.clone();
                store.revision += 1;
                object["metadata"]["resourceVersion"] = json!(store.revision.to_string());
                object["metadata"]["uid"] = uid;
                store.objects.insert(path, object.clone());
                respond(StatusCode::OK, object)
            }

            (Method::PATCH, false) => {
                store.revision += 1;
                let revision = store.revision.to_string();
                let Some(object) = store.objects.get_mut(&path) else {
                    return status(404, "not found");
                };
                merge(object, &body);
                object["metadata"]["resourceVersion"] = json!(revision);
                respond(StatusCode::OK, object.clone())
            }

            (Method::DELETE, false) => match store.objects.remove(&path) {
                Some(object) => respond(StatusCode::OK, object),
                None => status(404, "not found"),
            },

            _ => status(405, "method not allowed"),
        }
    }
}

/// Number of segments after the group/version prefix
fn resource_segments(path: &str) -> Option<usize> {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let prefix = match segments.first() {
        Some(&"api") => 2,
        Some(&"apis") => 3,
        _ => return None,
    };

    segments.len().checked_sub(prefix).filter(|n| *n > 0)
}

/// JSON merge patch
fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = json!({});
            }
            for (key, value) in entries {
                if value.is_null() {
                    if let Some(map) = target.as_object_mut() {
                        map.remove(key);
                    }
                } else {
                    merge(&mut target[key], value);
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn discovery(groups: &[String]) -> Value {
    let groups: Vec<Value> = groups
        .iter()
        .map(|name| {
            let version = json!({ "groupVersion": format!("{name}/v1"), "version": "v1" });
            json!({
                "name": name,
                "versions": [version.clone()],
                "preferredVersion": version,
            })
        })
        .collect();

    json!({ "kind": "APIGroupList", "apiVersion": "v1", "groups": groups })
}

fn respond(code: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(code)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn status(code: u16, message: &str) -> Response<Body> {
    let reason = match code {
        404 => "NotFound",
        409 if message.contains("exists") => "AlreadyExists",
        409 => "Conflict",
        422 => "Invalid",
        _ => "InternalError",
    };

    respond(
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_paths() {
        assert_eq!(resource_segments("/api/v1/namespaces"), Some(1));
        assert_eq!(resource_segments("/api/v1/namespaces/a"), Some(2));
        assert_eq!(resource_segments("/apis/apps/v1/namespaces/a/deployments"), Some(3));
        assert_eq!(resource_segments("/apis/apps/v1"), None);
        assert_eq!(resource_segments("/version"), None);
    }

    #[test]
    fn merge_patch_semantics() {
        let mut target = json!({ "a": 1, "b": { "c": 2, "d": 3 }, "e": [1] });
        merge(&mut target, &json!({ "a": null, "b": { "c": 4 }, "e": [2, 3] }));
        assert_eq!(target, json!({ "b": { "c": 4, "d": 3 }, "e": [2, 3] }));
    }
}

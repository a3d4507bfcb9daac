//! In-memory fakes for exercising the crate without network or git.
//!
//! [`FakePlatform`] is a [`Transport`] that answers the subset of the source
//! and target APIs this crate uses, keeps the resources it creates, records
//! every request and can inject failures. [`FakeMirror`] records mirror jobs
//! instead of running git.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Url;
use serde_json::{Value, json};

use crate::migration::{MirrorError, MirrorJob, RepositoryMirror};
use crate::reconcile::{GIT_SECURITY_NAMESPACE, same_name};
use crate::transport::{
    FailureKind, Method, PreparedRequest, RawResponse, Transport, TransportFailure,
    encode_component,
};

/// Answer forced by an injected failure rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeResponse {
    /// An HTTP answer with this status and body.
    Status(u16, String),
    /// A connection-level failure.
    Failure(FailureKind, String),
}

/// A request seen by [`FakePlatform`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRequest {
    /// HTTP method.
    pub method: Method,
    /// Full URL, including the query.
    pub url: String,
    /// Decoded JSON body, if any.
    pub body: Option<Value>,
}

#[derive(Debug)]
struct Rule {
    method: Option<Method>,
    fragment: String,
    response: FakeResponse,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct PlatformState {
    next_id: u64,
    source_projects: BTreeMap<String, Value>,
    projects: Vec<Value>,
    repositories: Vec<(String, Value)>,
    policies: Vec<(String, Value)>,
    groups: Vec<(String, Value)>,
    memberships: BTreeSet<(String, String)>,
    aces: BTreeMap<(String, String), (u64, u64)>,
    wikis: Vec<(String, Value)>,
    templates: Vec<(String, String, Value)>,
    rules: Vec<Rule>,
    log: Vec<LoggedRequest>,
}

impl PlatformState {
    fn next_guid(&mut self) -> String {
        self.next_id += 1;
        format!("{:08x}-0000-4000-8000-{:012x}", self.next_id, self.next_id)
    }

    fn project(&self, key: &str) -> Option<Value> {
        self.projects
            .iter()
            .find(|p| {
                let id = p["id"].as_str().unwrap_or_default();
                let name = p["name"].as_str().unwrap_or_default();
                id == key || encode_component(name).eq_ignore_ascii_case(key)
            })
            .cloned()
    }

    fn take_rule(&mut self, method: Method, url: &str) -> Option<FakeResponse> {
        let rule = self.rules.iter_mut().find(|rule| {
            rule.remaining != Some(0)
                && rule.method.is_none_or(|m| m == method)
                && url.contains(&rule.fragment)
        })?;
        if let Some(remaining) = &mut rule.remaining {
            *remaining -= 1;
        }
        Some(rule.response.clone())
    }
}

/// A stateful fake of both platform APIs.
///
/// Clones share state, so a test can keep one handle for inspection while
/// the [`TransportClient`](crate::transport::TransportClient) owns another.
#[derive(Debug, Clone)]
pub struct FakePlatform {
    source_base: String,
    target_base: String,
    state: Arc<Mutex<PlatformState>>,
}

impl FakePlatform {
    /// Creates an empty platform pair.
    #[must_use]
    pub fn new(source_base: &str, target_base: &str) -> Self {
        Self {
            source_base: source_base.trim_end_matches('/').to_string(),
            target_base: target_base.trim_end_matches('/').to_string(),
            state: Arc::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a source project. `None` as default branch models an empty
    /// repository.
    #[must_use]
    pub fn with_source_project(self, path: &str, default_branch: Option<&str>) -> Self {
        {
            let mut state = self.state();
            state.next_id += 1;
            let project = json!({
                "id": state.next_id,
                "path_with_namespace": path,
                "default_branch": default_branch,
                "visibility": "private",
                "lfs_enabled": false,
                "http_url_to_repo": format!("{}/{path}.git", self.source_base),
                "statistics": { "repository_size": 4096 },
            });
            state.source_projects.insert(path.to_string(), project);
        }
        self
    }

    /// Adds a target project.
    #[must_use]
    pub fn with_project(self, name: &str) -> Self {
        {
            let mut state = self.state();
            let id = state.next_guid();
            state.projects.push(json!({ "id": id, "name": name, "state": "wellFormed" }));
        }
        self
    }

    /// Adds a repository to an existing target project.
    #[must_use]
    pub fn with_repository(self, project: &str, name: &str) -> Self {
        {
            let mut state = self.state();
            if let Some(project) = state.project(&encode_component(project)) {
                let repository = self.new_repository(&mut state, &project, name);
                let project_id = project["id"].as_str().unwrap_or_default().to_string();
                state.repositories.push((project_id, repository));
            }
        }
        self
    }

    /// Adds a project-scoped group to an existing target project.
    #[must_use]
    pub fn with_group(self, project: &str, name: &str) -> Self {
        {
            let mut state = self.state();
            if let Some(project) = state.project(&encode_component(project)) {
                let scope = scope_descriptor(project["id"].as_str().unwrap_or_default());
                let group = new_group(&mut state, name, "");
                state.groups.push((scope, group));
            }
        }
        self
    }

    /// Forces the answer of every request whose URL contains `fragment`.
    #[must_use]
    pub fn with_failure(
        self,
        method: Option<Method>,
        fragment: &str,
        response: FakeResponse,
    ) -> Self {
        self.inject(method, fragment, response, None);
        self
    }

    /// Forces the answer of the next `times` matching requests.
    pub fn inject(
        &self,
        method: Option<Method>,
        fragment: &str,
        response: FakeResponse,
        times: Option<usize>,
    ) {
        self.state().rules.push(Rule {
            method,
            fragment: fragment.to_string(),
            response,
            remaining: times,
        });
    }

    /// Every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state().log.clone()
    }

    /// Number of requests with `method` whose URL contains `fragment`.
    #[must_use]
    pub fn count_requests(&self, method: Method, fragment: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|r| r.method == method && r.url.contains(fragment))
            .count()
    }

    /// Forgets the request log.
    pub fn clear_requests(&self) {
        self.state().log.clear();
    }

    /// Names of the repositories in a target project.
    #[must_use]
    pub fn repository_names(&self, project: &str) -> Vec<String> {
        let state = self.state();
        let Some(project) = state.project(&encode_component(project)) else {
            return Vec::new();
        };
        state
            .repositories
            .iter()
            .filter(|(pid, _)| Some(pid.as_str()) == project["id"].as_str())
            .filter_map(|(_, repo)| repo["name"].as_str().map(str::to_string))
            .collect()
    }

    /// Number of branch policy configurations across all projects.
    #[must_use]
    pub fn policy_count(&self) -> usize {
        self.state().policies.len()
    }

    /// Number of groups across all projects.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.state().groups.len()
    }

    /// Whether `member` belongs to `container`.
    #[must_use]
    pub fn has_membership(&self, member: &str, container: &str) -> bool {
        self.state()
            .memberships
            .contains(&(encode_component(member), encode_component(container)))
    }

    /// Deny bits stored for an identity on a security token.
    #[must_use]
    pub fn deny_bits(&self, token: &str, identity: &str) -> Option<u64> {
        self.state()
            .aces
            .get(&(token.to_string(), identity.to_string()))
            .map(|(_, deny)| *deny)
    }

    fn new_repository(&self, state: &mut PlatformState, project: &Value, name: &str) -> Value {
        let project_name = project["name"].as_str().unwrap_or_default();
        json!({
            "id": state.next_guid(),
            "name": name,
            "project": project,
            "remoteUrl": format!(
                "{}/{}/_git/{}",
                self.target_base,
                encode_component(project_name),
                encode_component(name)
            ),
        })
    }

    fn route(
        &self,
        state: &mut PlatformState,
        request: &PreparedRequest,
        body: Option<&Value>,
    ) -> RawResponse {
        let (path, query) = match Url::parse(&request.url) {
            Ok(url) => {
                let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
                let path = request.url.split('?').next().unwrap_or_default().to_string();
                (path, query)
            },
            Err(e) => return error(400, &format!("invalid url: {e}")),
        };

        if let Some(rest) = path.strip_prefix(&self.source_base) {
            let segments = split_path(rest);
            return match (request.method, segments.as_slice()) {
                (Method::Get, ["api", "v4", "projects", key]) => state
                    .source_projects
                    .iter()
                    .find(|(path, _)| encode_component(path).eq_ignore_ascii_case(key))
                    .map_or_else(|| error(404, "404 Project Not Found"), |(_, p)| ok(p)),
                _ => error(404, "404 Not Found"),
            };
        }
        let Some(rest) = path.strip_prefix(&self.target_base) else {
            return error(404, "unknown host");
        };
        let segments = split_path(rest);
        let param = |name: &str| query.get(name).cloned().unwrap_or_default();

        match (request.method, segments.as_slice()) {
            (Method::Get, ["_apis", "projects"]) => ok(&list(state.projects.clone())),
            (Method::Get, ["_apis", "projects", key]) => state.project(key).map_or_else(
                || error(404, &format!("TF200016: The following project does not exist: {key}")),
                |p| ok(&p),
            ),
            (Method::Get, [pid, "_apis", "git", "repositories", key]) => state
                .repositories
                .iter()
                .find(|(p, repo)| {
                    p == pid
                        && (repo["id"].as_str() == Some(*key)
                            || repo["name"]
                                .as_str()
                                .is_some_and(|n| encode_component(n).eq_ignore_ascii_case(key)))
                })
                .map_or_else(
                    || error(404, "TF401019: The Git repository does not exist"),
                    |(_, repo)| ok(repo),
                ),
            (Method::Post, [pid, "_apis", "git", "repositories"]) => {
                let Some(project) = state.project(pid) else {
                    return error(404, "project not found");
                };
                let name = body.and_then(|b| b["name"].as_str()).unwrap_or_default();
                let exists = state.repositories.iter().any(|(p, repo)| {
                    p == pid && repo["name"].as_str().is_some_and(|n| same_name(n, name))
                });
                if exists {
                    return error(
                        409,
                        &format!("TF400948: A Git repository with the name {name} already exists."),
                    );
                }
                let repository = self.new_repository(state, &project, name);
                state.repositories.push(((*pid).to_string(), repository.clone()));
                created(&repository)
            },
            (Method::Get, [pid, "_apis", "policy", "configurations"]) => {
                ok(&list(scoped(&state.policies, pid)))
            },
            (Method::Post, [pid, "_apis", "policy", "configurations"]) => {
                state.next_id += 1;
                let mut policy = body.cloned().unwrap_or_else(|| json!({}));
                policy["id"] = json!(state.next_id);
                state.policies.push(((*pid).to_string(), policy.clone()));
                ok(&policy)
            },
            (Method::Get, ["_apis", "graph", "descriptors", pid]) => {
                ok(&json!({ "value": scope_descriptor(pid) }))
            },
            (Method::Get, ["_apis", "graph", "groups"]) => {
                ok(&list(scoped(&state.groups, &param("scopeDescriptor"))))
            },
            (Method::Post, ["_apis", "graph", "groups"]) => {
                let name = body.and_then(|b| b["displayName"].as_str()).unwrap_or_default();
                let description = body.and_then(|b| b["description"].as_str()).unwrap_or_default();
                let group = new_group(state, name, description);
                state.groups.push((param("scopeDescriptor"), group.clone()));
                created(&group)
            },
            (method, ["_apis", "graph", "memberships", member, container]) => {
                let key = ((*member).to_string(), (*container).to_string());
                let membership = json!({
                    "memberDescriptor": member,
                    "containerDescriptor": container,
                });
                match method {
                    Method::Get if state.memberships.contains(&key) => ok(&membership),
                    Method::Get => error(404, "VS403328: membership not found"),
                    Method::Put if state.memberships.contains(&key) => {
                        error(409, "VS403334: membership already exists")
                    },
                    Method::Put => {
                        state.memberships.insert(key);
                        created(&membership)
                    },
                    _ => error(405, "method not allowed"),
                }
            },
            (Method::Get, ["_apis", "identities"]) => {
                let subject = param("subjectDescriptors");
                let known = state
                    .groups
                    .iter()
                    .any(|(_, g)| g["descriptor"].as_str() == Some(subject.as_str()));
                if known {
                    ok(&list(vec![json!({
                        "descriptor": identity_descriptor(&subject),
                        "subjectDescriptor": subject,
                    })]))
                } else {
                    ok(&list(Vec::new()))
                }
            },
            (Method::Get, ["_apis", "accesscontrollists", namespace])
                if *namespace == GIT_SECURITY_NAMESPACE =>
            {
                let token = param("token");
                let descriptor = param("descriptors");
                let aces: serde_json::Map<String, Value> = state
                    .aces
                    .iter()
                    .filter(|((t, d), _)| *t == token && *d == descriptor)
                    .map(|((_, d), (allow, deny))| {
                        (d.clone(), json!({ "descriptor": d, "allow": allow, "deny": deny }))
                    })
                    .collect();
                ok(&list(vec![json!({ "token": token, "acesDictionary": aces })]))
            },
            (Method::Post, ["_apis", "accesscontrolentries", namespace])
                if *namespace == GIT_SECURITY_NAMESPACE =>
            {
                let Some(body) = body else {
                    return error(400, "missing body");
                };
                let token = body["token"].as_str().unwrap_or_default().to_string();
                let merge = body["merge"].as_bool().unwrap_or(false);
                let mut written = Vec::new();
                for ace in body["accessControlEntries"].as_array().into_iter().flatten() {
                    let descriptor = ace["descriptor"].as_str().unwrap_or_default().to_string();
                    let allow = ace["allow"].as_u64().unwrap_or(0);
                    let deny = ace["deny"].as_u64().unwrap_or(0);
                    let entry = state
                        .aces
                        .entry((token.clone(), descriptor.clone()))
                        .or_insert((0, 0));
                    *entry = if merge {
                        (entry.0 | allow, entry.1 | deny)
                    } else {
                        (allow, deny)
                    };
                    written.push(json!({
                        "descriptor": descriptor,
                        "allow": entry.0,
                        "deny": entry.1,
                    }));
                }
                ok(&list(written))
            },
            (Method::Get, [pid, "_apis", "wiki", "wikis"]) => ok(&list(scoped(&state.wikis, pid))),
            (Method::Post, [pid, "_apis", "wiki", "wikis"]) => {
                let mut wiki = body.cloned().unwrap_or_else(|| json!({}));
                wiki["id"] = json!(state.next_guid());
                state.wikis.push(((*pid).to_string(), wiki.clone()));
                created(&wiki)
            },
            (Method::Get, [pid, team, "_apis", "wit", "templates"]) => {
                let work_item_type = param("workitemtypename");
                let templates = state
                    .templates
                    .iter()
                    .filter(|(p, t, template)| {
                        p == pid
                            && t == team
                            && template["workItemTypeName"]
                                .as_str()
                                .is_some_and(|w| same_name(w, &work_item_type))
                    })
                    .map(|(_, _, template)| template.clone())
                    .collect();
                ok(&list(templates))
            },
            (Method::Post, [pid, team, "_apis", "wit", "templates"]) => {
                let mut template = body.cloned().unwrap_or_else(|| json!({}));
                template["id"] = json!(state.next_guid());
                state
                    .templates
                    .push(((*pid).to_string(), (*team).to_string(), template.clone()));
                created(&template)
            },
            _ => error(404, "no such route"),
        }
    }
}

impl Transport for FakePlatform {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn execute(&self, request: &PreparedRequest) -> Result<RawResponse, TransportFailure> {
        let body = request
            .body
            .as_deref()
            .and_then(|b| serde_json::from_str::<Value>(b).ok());
        let mut state = self.state();
        state.log.push(LoggedRequest {
            method: request.method,
            url: request.url.clone(),
            body: body.clone(),
        });
        match state.take_rule(request.method, &request.url) {
            Some(FakeResponse::Status(status, body)) => return Ok(RawResponse::new(status, body)),
            Some(FakeResponse::Failure(kind, message)) => {
                return Err(TransportFailure::new(kind, message));
            },
            None => {},
        }
        Ok(self.route(&mut state, request, body.as_ref()))
    }
}

/// A mirror job as seen by [`FakeMirror`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorCall {
    /// Source path.
    pub source: String,
    /// `<project>/<repository>`.
    pub target: String,
    /// Whether LFS objects were requested.
    pub lfs: bool,
    /// Whether both remotes carried credentials, outside their URLs.
    pub credentialed: bool,
}

/// Records mirror jobs; fails for configured sources.
#[derive(Debug, Clone, Default)]
pub struct FakeMirror {
    calls: Arc<Mutex<Vec<MirrorCall>>>,
    failing: Arc<Mutex<BTreeSet<String>>>,
}

impl FakeMirror {
    /// Creates a mirror that succeeds for every job.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes jobs for `source` fail.
    #[must_use]
    pub fn failing_for(self, source: &str) -> Self {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.to_string());
        self
    }

    /// Jobs received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MirrorCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RepositoryMirror for FakeMirror {
    fn mirror(&self, job: &MirrorJob) -> Result<(), MirrorError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MirrorCall {
                source: job.source_display.clone(),
                target: job.target_display.clone(),
                lfs: job.lfs,
                credentialed: job.source.has_credentials()
                    && job.target.has_credentials()
                    && !job.source.url().contains('@')
                    && !job.target.url().contains('@'),
            });
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&job.source_display);
        if failing {
            return Err(MirrorError::Other(format!(
                "remote rejected push for {}",
                job.source_display
            )));
        }
        Ok(())
    }
}

fn split_path(rest: &str) -> Vec<&str> {
    rest.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

fn scope_descriptor(project_id: &str) -> String {
    format!("scp.{project_id}")
}

fn identity_descriptor(subject: &str) -> String {
    format!("Microsoft.TeamFoundation.Identity;{subject}")
}

fn new_group(state: &mut PlatformState, name: &str, description: &str) -> Value {
    state.next_id += 1;
    json!({
        "descriptor": format!("vssgp.{:06}", state.next_id),
        "displayName": name,
        "description": description,
    })
}

fn scoped(items: &[(String, Value)], scope: &str) -> Vec<Value> {
    items
        .iter()
        .filter(|(s, _)| s == scope)
        .map(|(_, v)| v.clone())
        .collect()
}

fn list(items: Vec<Value>) -> Value {
    json!({ "count": items.len(), "value": items })
}

fn ok(value: &Value) -> RawResponse {
    RawResponse::new(200, value.to_string())
}

fn created(value: &Value) -> RawResponse {
    RawResponse::new(201, value.to_string())
}

fn error(status: u16, message: &str) -> RawResponse {
    RawResponse::new(status, json!({ "message": message }).to_string())
}

//! Backend (apisonator) component: listener, worker and cron workloads plus
//! their services, routes, secrets, disruption budgets and monitoring.

use std::collections::BTreeMap;

use amp_schema::{
    GrafanaDashboard, GrafanaDashboardSpec, PodMetricsEndpoint, PodMonitor, PodMonitorSpec, PrometheusRule,
    PrometheusRuleSpec, Route, RoutePort, RouteSpec, RouteTargetReference, Rule, RuleGroup, TlsConfig,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapKeySelector, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, PodSpec,
    PodTemplateSpec, Probe, Secret, SecretKeySelector, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use crate::{BackendOptions, ComponentOptions};

pub const LISTENER: &str = "backend-listener";
pub const WORKER: &str = "backend-worker";
pub const CRON: &str = "backend-cron";
pub const ROUTE: &str = "backend";
pub const DASHBOARD: &str = "backend";
pub const ENVIRONMENT_CONFIGMAP: &str = "backend-environment";
pub const INTERNAL_API_SECRET: &str = "backend-internal-api";
pub const LISTENER_SECRET: &str = "backend-listener";
/// Read, never managed here.
pub const REDIS_SECRET: &str = "backend-redis";

pub const LISTENER_PORT: i32 = 3000;
pub const LISTENER_METRICS_PORT: i32 = 9394;
pub const WORKER_METRICS_PORT: i32 = 9421;

/// Env vars the listener env mutator owns in async mode.
pub const LISTENER_ASYNC_ENV: &[&str] = &["CONFIG_REDIS_ASYNC", "LISTENER_WORKERS"];
/// Env vars the worker env mutator owns in async mode.
pub const WORKER_ASYNC_ENV: &[&str] = &["CONFIG_REDIS_ASYNC"];

const APP_LABEL: &str = "3scale-api-management";

fn labels(element: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_LABEL.to_string()),
        ("threescale_component".to_string(), "backend".to_string()),
        ("threescale_component_element".to_string(), element.to_string()),
    ])
}

fn selector_labels(deployment: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("deployment".to_string(), deployment.to_string())])
}

fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar { name: name.into(), value: Some(value.into()), ..Default::default() }
}

fn env_from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector { name: secret.into(), key: key.into(), ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_from_configmap(name: &str, cm: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector { name: cm.into(), key: key.into(), ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn port(name: &str, number: i32) -> ContainerPort {
    ContainerPort { name: Some(name.into()), container_port: number, protocol: Some("TCP".into()), ..Default::default() }
}

fn string_data(pairs: &[(&str, &str)]) -> BTreeMap<String, ByteString> {
    pairs.iter().map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec()))).collect()
}

/// Builds every desired backend object from resolved [`BackendOptions`].
#[derive(Debug, Clone)]
pub struct Backend {
    opts: BackendOptions,
}

impl Backend {
    pub fn new(opts: BackendOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &BackendOptions {
        &self.opts
    }

    fn meta(&self, name: &str, element: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some(self.opts.namespace.clone()),
            labels: Some(labels(element)),
            ..Default::default()
        }
    }

    pub fn route_host(&self) -> String {
        format!("backend-{}.{}", self.opts.tenant_name, self.opts.wildcard_domain)
    }

    fn common_env(&self) -> Vec<EnvVar> {
        vec![
            env_from_configmap("RACK_ENV", ENVIRONMENT_CONFIGMAP, "RACK_ENV"),
            env_from_secret("CONFIG_REDIS_PROXY", REDIS_SECRET, "REDIS_STORAGE_URL"),
            env_from_secret("CONFIG_REDIS_SENTINEL_HOSTS", REDIS_SECRET, "REDIS_STORAGE_SENTINEL_HOSTS"),
            env_from_secret("CONFIG_QUEUES_MASTER_NAME", REDIS_SECRET, "REDIS_QUEUES_URL"),
            env_from_secret("CONFIG_QUEUES_SENTINEL_HOSTS", REDIS_SECRET, "REDIS_QUEUES_SENTINEL_HOSTS"),
        ]
    }

    fn deployment(&self, name: &str, element: &str, c: &ComponentOptions, mut container: Container) -> Deployment {
        container.name = name.to_string();
        container.image = Some(self.opts.image.clone());
        container.image_pull_policy = Some("IfNotPresent".into());
        container.resources = Some(c.resources.clone());

        let mut pod_labels = labels(element);
        pod_labels.extend(selector_labels(name));

        Deployment {
            metadata: self.meta(name, element),
            spec: Some(DeploymentSpec {
                replicas: Some(c.replicas),
                selector: LabelSelector { match_labels: Some(selector_labels(name)), ..Default::default() },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(pod_labels), ..Default::default() }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        affinity: c.affinity.clone(),
                        tolerations: c.tolerations.clone(),
                        priority_class_name: c.priority_class_name.clone(),
                        service_account_name: Some("amp".into()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn listener_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["bin/3scale_backend", "start", "-e", "production", "-p", "3000", "-x", "/dev/stdout"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if self.opts.redis_async {
            args.extend(["-s".to_string(), "falcon".to_string()]);
        }
        args
    }

    pub fn listener_deployment(&self) -> Deployment {
        let mut env = self.common_env();
        env.push(env_value("CONFIG_LISTENER_PROMETHEUS_METRICS_ENABLED", "true"));
        env.push(env_value("CONFIG_LISTENER_PROMETHEUS_METRICS_PORT", &LISTENER_METRICS_PORT.to_string()));
        env.push(env_from_secret("CONFIG_INTERNAL_API_USER", INTERNAL_API_SECRET, "username"));
        env.push(env_from_secret("CONFIG_INTERNAL_API_PASSWORD", INTERNAL_API_SECRET, "password"));
        if self.opts.redis_async {
            env.push(env_value("CONFIG_REDIS_ASYNC", "1"));
            env.push(env_value("LISTENER_WORKERS", "1"));
        }
        let container = Container {
            args: Some(self.listener_args()),
            env: Some(env),
            ports: Some(vec![port("http", LISTENER_PORT), port("metrics", LISTENER_METRICS_PORT)]),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/status".into()),
                    port: IntOrString::Int(LISTENER_PORT),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(30),
                timeout_seconds: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.deployment(LISTENER, "listener", &self.opts.listener, container)
    }

    pub fn worker_deployment(&self) -> Deployment {
        let mut env = self.common_env();
        env.push(env_value("CONFIG_WORKER_PROMETHEUS_METRICS_ENABLED", "true"));
        env.push(env_value("CONFIG_WORKER_PROMETHEUS_METRICS_PORT", &WORKER_METRICS_PORT.to_string()));
        if self.opts.redis_async {
            env.push(env_value("CONFIG_REDIS_ASYNC", "1"));
        }
        let container = Container {
            args: Some(vec!["bin/3scale_backend_worker".into(), "run".into()]),
            env: Some(env),
            ports: Some(vec![port("metrics", WORKER_METRICS_PORT)]),
            ..Default::default()
        };
        self.deployment(WORKER, "worker", &self.opts.worker, container)
    }

    pub fn cron_deployment(&self) -> Deployment {
        let container = Container {
            args: Some(vec!["backend-cron".into()]),
            env: Some(self.common_env()),
            ..Default::default()
        };
        self.deployment(CRON, "cron", &self.opts.cron, container)
    }

    pub fn listener_service(&self) -> Service {
        Service {
            metadata: self.meta(LISTENER, "listener"),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("http".into()),
                    port: LISTENER_PORT,
                    target_port: Some(IntOrString::Int(LISTENER_PORT)),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                selector: Some(selector_labels(LISTENER)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn listener_route(&self) -> Route {
        let mut route = Route::new(
            ROUTE,
            RouteSpec {
                host: Some(self.route_host()),
                to: RouteTargetReference { kind: "Service".into(), name: LISTENER.into() },
                port: Some(RoutePort { target_port: IntOrString::String("http".into()) }),
                tls: Some(TlsConfig {
                    termination: "edge".into(),
                    insecure_edge_termination_policy: Some("Allow".into()),
                }),
            },
        );
        route.metadata = self.meta(ROUTE, "listener");
        route
    }

    pub fn environment_config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: self.meta(ENVIRONMENT_CONFIGMAP, "backend"),
            data: Some(BTreeMap::from([("RACK_ENV".to_string(), "production".to_string())])),
            ..Default::default()
        }
    }

    pub fn internal_api_secret(&self) -> Secret {
        Secret {
            metadata: self.meta(INTERNAL_API_SECRET, "backend"),
            data: Some(string_data(&[
                ("username", self.opts.internal_api_username.as_str()),
                ("password", self.opts.internal_api_password.as_str()),
            ])),
            type_: Some("Opaque".into()),
            ..Default::default()
        }
    }

    pub fn listener_secret(&self) -> Secret {
        let service_endpoint = format!("http://{}:{}", LISTENER, LISTENER_PORT);
        let route_endpoint = format!("https://{}", self.route_host());
        Secret {
            metadata: self.meta(LISTENER_SECRET, "listener"),
            data: Some(string_data(&[("service_endpoint", service_endpoint.as_str()), ("route_endpoint", route_endpoint.as_str())])),
            type_: Some("Opaque".into()),
            ..Default::default()
        }
    }

    fn pdb(&self, deployment: &str, element: &str) -> PodDisruptionBudget {
        PodDisruptionBudget {
            metadata: self.meta(deployment, element),
            spec: Some(PodDisruptionBudgetSpec {
                max_unavailable: Some(IntOrString::Int(1)),
                selector: Some(LabelSelector { match_labels: Some(selector_labels(deployment)), ..Default::default() }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn worker_pdb(&self) -> PodDisruptionBudget {
        self.pdb(WORKER, "worker")
    }

    pub fn cron_pdb(&self) -> PodDisruptionBudget {
        self.pdb(CRON, "cron")
    }

    pub fn listener_pdb(&self) -> PodDisruptionBudget {
        self.pdb(LISTENER, "listener")
    }

    fn pod_monitor(&self, deployment: &str, element: &str) -> PodMonitor {
        let mut pm = PodMonitor::new(
            deployment,
            PodMonitorSpec {
                selector: LabelSelector { match_labels: Some(selector_labels(deployment)), ..Default::default() },
                pod_metrics_endpoints: vec![PodMetricsEndpoint {
                    port: "metrics".into(),
                    path: Some("/metrics".into()),
                    scheme: Some("http".into()),
                }],
            },
        );
        pm.metadata = self.meta(deployment, element);
        pm
    }

    pub fn worker_pod_monitor(&self) -> PodMonitor {
        self.pod_monitor(WORKER, "worker")
    }

    pub fn listener_pod_monitor(&self) -> PodMonitor {
        self.pod_monitor(LISTENER, "listener")
    }

    pub fn grafana_dashboard(&self) -> GrafanaDashboard {
        let ns = &self.opts.namespace;
        let panel = |title: &str, expr: String| serde_json::json!({ "title": title, "type": "graph", "targets": [{ "expr": expr }] });
        let json = serde_json::json!({
            "title": format!("{} / 3scale / Backend", ns),
            "uid": format!("{}-backend", ns),
            "panels": [
                panel("Listener responses", format!("sum(rate(apisonator_listener_response_codes{{namespace='{}'}}[1m])) by (resp_code)", ns)),
                panel("Worker jobs", format!("sum(rate(apisonator_worker_job_count{{namespace='{}'}}[1m])) by (type)", ns)),
                panel("Worker job runtime", format!("avg(rate(apisonator_worker_job_runtime_seconds_sum{{namespace='{}'}}[1m]))", ns)),
            ],
        });
        let mut dashboard = GrafanaDashboard::new(DASHBOARD, GrafanaDashboardSpec { json: json.to_string(), name: Some("backend.json".into()) });
        dashboard.metadata = self.meta(DASHBOARD, "backend");
        if let Some(l) = dashboard.metadata.labels.as_mut() {
            l.insert("monitoring-key".into(), "middleware".into());
        }
        dashboard
    }

    fn prometheus_rules(&self, deployment: &str, element: &str, rules: Vec<Rule>) -> PrometheusRule {
        let mut pr = PrometheusRule::new(
            deployment,
            PrometheusRuleSpec { groups: vec![RuleGroup { name: format!("{}/{}.rules", self.opts.namespace, deployment), rules }] },
        );
        pr.metadata = self.meta(deployment, element);
        if let Some(l) = pr.metadata.labels.as_mut() {
            l.insert("prometheus".into(), "application-monitoring".into());
            l.insert("role".into(), "alert-rules".into());
        }
        pr
    }

    fn alert(&self, name: &str, summary: &str, expr: String, for_duration: &str, severity: &str) -> Rule {
        Rule {
            alert: name.into(),
            expr,
            for_duration: Some(for_duration.into()),
            labels: BTreeMap::from([("severity".to_string(), severity.to_string())]),
            annotations: BTreeMap::from([("summary".to_string(), summary.to_string())]),
        }
    }

    pub fn worker_prometheus_rules(&self) -> PrometheusRule {
        let ns = &self.opts.namespace;
        let rules = vec![self.alert(
            "ThreescaleBackendWorkerJobsCountRunningHigh",
            "Backend worker jobs running count is high",
            format!("sum(avg_over_time(apisonator_worker_job_count{{namespace='{}'}}[5m])) > 1000", ns),
            "5m",
            "critical",
        )];
        self.prometheus_rules(WORKER, "worker", rules)
    }

    pub fn listener_prometheus_rules(&self) -> PrometheusRule {
        let ns = &self.opts.namespace;
        let rules = vec![self.alert(
            "ThreescaleBackendListener5XXRequestsHigh",
            "Backend listener 5XX responses are high",
            format!("sum(rate(apisonator_listener_response_codes{{namespace='{}',resp_code='5xx'}}[5m])) > 4000", ns),
            "5m",
            "warning",
        )];
        self.prometheus_rules(LISTENER, "listener", rules)
    }
}

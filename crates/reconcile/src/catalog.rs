//! Reusable merge policies: create-only, defaults-only, field sync and
//! multi-field sync, plus the per-kind compositions built from them.

use std::collections::BTreeMap;

use amp_schema::GrafanaDashboard;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use crate::mutator::Mutator;

/// Never touches an object once it exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOnly;

impl<K> Mutator<K> for CreateOnly {
    fn name(&self) -> &str {
        "create-only"
    }

    fn mutate(&self, _desired: &K, _existing: &mut K) -> bool {
        false
    }
}

/// Accessor pair for one field of `K`.
///
/// `get` yields `None` when a parent of the field is absent; that reads as
/// `T::default()`. `get_mut` materializes parents and is only called on write.
pub struct Field<K, T> {
    name: &'static str,
    get: fn(&K) -> Option<&T>,
    get_mut: fn(&mut K) -> &mut T,
}

impl<K, T> Clone for Field<K, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, T> Copy for Field<K, T> {}

impl<K, T> Field<K, T>
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
{
    pub fn new(name: &'static str, get: fn(&K) -> Option<&T>, get_mut: fn(&mut K) -> &mut T) -> Self {
        Self { name, get, get_mut }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current value, with an absent parent read as the zero value.
    pub fn value(&self, obj: &K) -> T {
        (self.get)(obj).cloned().unwrap_or_default()
    }

    fn is_zero(&self, obj: &K) -> bool {
        match (self.get)(obj) {
            Some(v) => *v == T::default(),
            None => true,
        }
    }

    /// Copy desired into existing whenever they differ.
    pub fn sync(self) -> FieldSync<K, T> {
        FieldSync(self)
    }

    /// Copy desired into existing only while existing is still zero.
    pub fn defaults(self) -> DefaultsOnly<K, T> {
        DefaultsOnly(self)
    }
}

pub struct FieldSync<K, T>(Field<K, T>);

impl<K, T> Mutator<K> for FieldSync<K, T>
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.0.name
    }

    fn mutate(&self, desired: &K, existing: &mut K) -> bool {
        let f = &self.0;
        let zero = T::default();
        let want = (f.get)(desired).unwrap_or(&zero);
        if (f.get)(existing).unwrap_or(&zero) == want {
            return false;
        }
        *(f.get_mut)(existing) = want.clone();
        true
    }
}

pub struct DefaultsOnly<K, T>(Field<K, T>);

impl<K, T> Mutator<K> for DefaultsOnly<K, T>
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.0.name
    }

    fn mutate(&self, desired: &K, existing: &mut K) -> bool {
        let f = &self.0;
        if f.is_zero(desired) || !f.is_zero(existing) {
            return false;
        }
        *(f.get_mut)(existing) = f.value(desired);
        true
    }
}

/// Key-wise defaults over a string-keyed map: keys missing from existing are
/// copied in, keys already present keep their live value.
pub struct KeyDefaults<K, V>(Field<K, Option<BTreeMap<String, V>>>);

impl<K, V> KeyDefaults<K, V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(field: Field<K, Option<BTreeMap<String, V>>>) -> Self {
        Self(field)
    }
}

impl<K, V> Mutator<K> for KeyDefaults<K, V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.0.name
    }

    fn mutate(&self, desired: &K, existing: &mut K) -> bool {
        let f = &self.0;
        let want = match (f.get)(desired) {
            Some(Some(m)) => m,
            _ => return false,
        };
        let missing: Vec<(&String, &V)> = {
            let have = (f.get)(existing).and_then(|m| m.as_ref());
            want.iter().filter(|(k, _)| !have.map(|h| h.contains_key(*k)).unwrap_or(false)).collect()
        };
        if missing.is_empty() {
            return false;
        }
        let have = (f.get_mut)(existing).get_or_insert_with(BTreeMap::new);
        for (k, v) in missing {
            have.insert(k.clone(), v.clone());
        }
        true
    }
}

/// Named group of field mutators evaluated together; all members always run.
pub struct MultiFieldSync<K> {
    name: &'static str,
    members: Vec<Box<dyn Mutator<K>>>,
}

impl<K: 'static> MultiFieldSync<K> {
    pub fn new(name: &'static str) -> Self {
        Self { name, members: Vec::new() }
    }

    pub fn field<T>(mut self, f: Field<K, T>) -> Self
    where
        T: Clone + PartialEq + Default + Send + Sync + 'static,
    {
        self.members.push(Box::new(f.sync()));
        self
    }

    pub fn with(mut self, m: impl Mutator<K> + 'static) -> Self {
        self.members.push(Box::new(m));
        self
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name()).collect()
    }
}

impl<K> Mutator<K> for MultiFieldSync<K> {
    fn name(&self) -> &str {
        self.name
    }

    fn mutate(&self, desired: &K, existing: &mut K) -> bool {
        let mut changed = false;
        for m in &self.members {
            changed |= m.mutate(desired, existing);
        }
        changed
    }
}

// ---- per-kind compositions ----

pub fn secret_data() -> Field<Secret, Option<BTreeMap<String, ByteString>>> {
    Field::<Secret, Option<BTreeMap<String, ByteString>>>::new("secret-data", |s| Some(&s.data), |s| &mut s.data)
}

/// Generated secrets: backfill new keys, never rotate existing ones.
pub fn secret_defaults() -> KeyDefaults<Secret, ByteString> {
    KeyDefaults::new(secret_data())
}

pub fn pdb_selector() -> Field<PodDisruptionBudget, Option<LabelSelector>> {
    Field::<PodDisruptionBudget, Option<LabelSelector>>::new(
        "pdb-selector",
        |p| p.spec.as_ref().map(|s| &s.selector),
        |p| &mut p.spec.get_or_insert_with(Default::default).selector,
    )
}

pub fn pdb_max_unavailable() -> Field<PodDisruptionBudget, Option<IntOrString>> {
    Field::<PodDisruptionBudget, Option<IntOrString>>::new(
        "pdb-max-unavailable",
        |p| p.spec.as_ref().map(|s| &s.max_unavailable),
        |p| &mut p.spec.get_or_insert_with(Default::default).max_unavailable,
    )
}

pub fn pdb_min_available() -> Field<PodDisruptionBudget, Option<IntOrString>> {
    Field::<PodDisruptionBudget, Option<IntOrString>>::new(
        "pdb-min-available",
        |p| p.spec.as_ref().map(|s| &s.min_available),
        |p| &mut p.spec.get_or_insert_with(Default::default).min_available,
    )
}

pub fn pdb_generic() -> MultiFieldSync<PodDisruptionBudget> {
    MultiFieldSync::new("pdb-generic")
        .field(pdb_selector())
        .field(pdb_max_unavailable())
        .field(pdb_min_available())
}

pub fn dashboard_json() -> Field<GrafanaDashboard, String> {
    Field::<GrafanaDashboard, String>::new("dashboard-json", |g| Some(&g.spec.json), |g| &mut g.spec.json)
}

pub fn dashboard_labels() -> Field<GrafanaDashboard, Option<BTreeMap<String, String>>> {
    Field::<GrafanaDashboard, Option<BTreeMap<String, String>>>::new(
        "dashboard-labels",
        |g| Some(&g.metadata.labels),
        |g| &mut g.metadata.labels,
    )
}

pub fn dashboard_generic() -> MultiFieldSync<GrafanaDashboard> {
    MultiFieldSync::new("dashboard-generic").field(dashboard_json()).field(dashboard_labels())
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_schema::{GrafanaDashboardSpec, Route, RouteSpec, RouteTargetReference};
    use k8s_openapi::api::policy::v1::PodDisruptionBudgetSpec;

    fn dashboard(json: &str) -> GrafanaDashboard {
        GrafanaDashboard::new("backend", GrafanaDashboardSpec { json: json.to_string(), name: None })
    }

    fn route(host: Option<&str>) -> Route {
        Route::new(
            "backend",
            RouteSpec {
                host: host.map(str::to_string),
                to: RouteTargetReference { kind: "Service".into(), name: "backend-listener".into() },
                ..Default::default()
            },
        )
    }

    fn route_host() -> Field<Route, Option<String>> {
        Field::<Route, Option<String>>::new("route-host", |r| Some(&r.spec.host), |r| &mut r.spec.host)
    }

    #[test]
    fn create_only_never_changes() {
        let desired = route(Some("new.example.net"));
        let mut existing = route(Some("custom.example.net"));
        for _ in 0..3 {
            assert!(!CreateOnly.mutate(&desired, &mut existing));
        }
        assert_eq!(existing.spec.host.as_deref(), Some("custom.example.net"));
    }

    #[test]
    fn defaults_backfill_then_hold() {
        let m = dashboard_json().defaults();
        let mut existing = dashboard("");
        assert!(m.mutate(&dashboard("v2"), &mut existing));
        assert_eq!(existing.spec.json, "v2");

        assert!(!m.mutate(&dashboard("v3"), &mut existing));
        assert_eq!(existing.spec.json, "v2");
    }

    #[test]
    fn defaults_ignore_zero_desired() {
        let m = route_host().defaults();
        let mut existing = route(None);
        assert!(!m.mutate(&route(None), &mut existing));
        assert!(existing.spec.host.is_none());
        assert!(m.mutate(&route(Some("a.example.net")), &mut existing));
        assert_eq!(existing.spec.host.as_deref(), Some("a.example.net"));
    }

    #[test]
    fn sync_uses_structural_equality() {
        let m = route_host().sync();
        let desired = route(Some("a.example.net"));
        let mut existing = route(Some("a.example.net"));
        assert!(!m.mutate(&desired, &mut existing), "distinct but equal values are converged");

        let mut drifted = route(Some("b.example.net"));
        assert!(m.mutate(&desired, &mut drifted));
        assert_eq!(drifted.spec.host.as_deref(), Some("a.example.net"));
        assert!(!m.mutate(&desired, &mut drifted));
    }

    #[test]
    fn sync_does_not_materialize_absent_parents() {
        let m = pdb_max_unavailable().sync();
        let desired = PodDisruptionBudget::default();
        let mut existing = PodDisruptionBudget::default();
        assert!(!m.mutate(&desired, &mut existing));
        assert!(existing.spec.is_none());
    }

    #[test]
    fn secret_defaults_adds_missing_keys_only() {
        let desired = Secret {
            data: Some(BTreeMap::from([
                ("username".to_string(), ByteString(b"api".to_vec())),
                ("password".to_string(), ByteString(b"generated".to_vec())),
            ])),
            ..Default::default()
        };
        let mut existing = Secret {
            data: Some(BTreeMap::from([("password".to_string(), ByteString(b"rotated-by-admin".to_vec()))])),
            ..Default::default()
        };
        let m = secret_defaults();
        assert!(m.mutate(&desired, &mut existing));
        let data = existing.data.clone().unwrap();
        assert_eq!(data["username"], ByteString(b"api".to_vec()));
        assert_eq!(data["password"], ByteString(b"rotated-by-admin".to_vec()));
        assert!(!m.mutate(&desired, &mut existing));
    }

    #[test]
    fn secret_defaults_fill_empty_secret() {
        let desired = Secret {
            data: Some(BTreeMap::from([("token".to_string(), ByteString(b"t".to_vec()))])),
            ..Default::default()
        };
        let mut existing = Secret::default();
        assert!(secret_defaults().mutate(&desired, &mut existing));
        assert_eq!(existing.data.unwrap().len(), 1);
    }

    #[test]
    fn pdb_generic_syncs_all_members() {
        let desired = PodDisruptionBudget {
            spec: Some(PodDisruptionBudgetSpec {
                max_unavailable: Some(IntOrString::Int(1)),
                selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([("deployment".to_string(), "backend-worker".to_string())])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut existing = PodDisruptionBudget {
            spec: Some(PodDisruptionBudgetSpec { min_available: Some(IntOrString::Int(2)), ..Default::default() }),
            ..Default::default()
        };
        let m = pdb_generic();
        assert_eq!(m.member_names(), vec!["pdb-selector", "pdb-max-unavailable", "pdb-min-available"]);
        assert!(m.mutate(&desired, &mut existing));
        assert_eq!(existing.spec, desired.spec);
        assert!(!m.mutate(&desired, &mut existing));
    }

    #[test]
    fn disjoint_mutators_commute() {
        let desired = {
            let mut d = dashboard("{\"v\":2}");
            d.metadata.labels = Some(BTreeMap::from([("app".to_string(), "3scale".to_string())]));
            d
        };
        let base = dashboard("{\"v\":1}");

        let mut ab = base.clone();
        dashboard_json().sync().mutate(&desired, &mut ab);
        dashboard_labels().sync().mutate(&desired, &mut ab);

        let mut ba = base.clone();
        dashboard_labels().sync().mutate(&desired, &mut ba);
        dashboard_json().sync().mutate(&desired, &mut ba);

        assert_eq!(ab.spec, ba.spec);
        assert_eq!(ab.metadata.labels, ba.metadata.labels);
    }
}

//! Result catalog: a FOV -> artifact-paths manifest with idempotent merge
//! (§3, §4.H, §6).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Per-FOV record of every artifact a stage has produced so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FOVResultPaths {
    pub pc: Option<(usize, PathBuf)>,
    #[serde(default)]
    pub fl: Vec<(usize, PathBuf)>,
    pub seg: Option<(usize, PathBuf)>,
    pub seg_labeled: Option<(usize, PathBuf)>,
    #[serde(default)]
    pub fl_background: Vec<(usize, PathBuf)>,
    pub traces: Option<PathBuf>,
}

impl FOVResultPaths {
    fn add_unique(list: &mut Vec<(usize, PathBuf)>, channel: usize, path: PathBuf) {
        let key = (channel, path.to_string_lossy().into_owned());
        let exists = list
            .iter()
            .any(|(c, p)| (*c, p.to_string_lossy().into_owned()) == key);
        if !exists {
            list.push((channel, path));
        }
    }

    fn merge_from(&mut self, other: &FOVResultPaths) {
        if self.pc.is_none() {
            self.pc = other.pc.clone();
        }
        if self.seg.is_none() {
            self.seg = other.seg.clone();
        }
        if self.seg_labeled.is_none() {
            self.seg_labeled = other.seg_labeled.clone();
        }
        if self.traces.is_none() {
            self.traces = other.traces.clone();
        }
        for (ch, path) in &other.fl {
            Self::add_unique(&mut self.fl, *ch, path.clone());
        }
        for (ch, path) in &other.fl_background {
            Self::add_unique(&mut self.fl_background, *ch, path.clone());
        }
    }
}

/// { pc: channel_index | null, fl: [channel_index, ...] } — the channels
/// actually selected for this run (§3, §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogChannels {
    pub pc: Option<usize>,
    #[serde(default)]
    pub fl: Vec<usize>,
}

/// FOV-index -> FOVResultPaths, plus the run-level scalars named in §6.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultCatalog {
    pub output_dir: Option<PathBuf>,
    pub channels: Option<CatalogChannels>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    pub time_units: Option<String>,
    #[serde(default, with = "fov_keys_as_strings")]
    pub results: BTreeMap<usize, FOVResultPaths>,
}

/// Spec §6 requires `results` to be keyed by the *string* form of the FOV
/// index (`"0":`, not the bare YAML int `0:`), so a standard YAML loader
/// sees the same map shape a non-Rust consumer would. `BTreeMap<usize, _>`'s
/// own `Serialize`/`Deserialize` impls go through serde's `serialize_u64`,
/// which serde_yaml emits as a `!!int` scalar; this module re-keys through
/// `String` on the way in and out so the on-disk document matches the
/// contract exactly.
mod fov_keys_as_strings {
    use std::collections::BTreeMap;

    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    use super::FOVResultPaths;

    pub fn serialize<S>(
        map: &BTreeMap<usize, FOVResultPaths>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let stringified: BTreeMap<String, &FOVResultPaths> =
            map.iter().map(|(fov, paths)| (fov.to_string(), paths)).collect();
        stringified.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<usize, FOVResultPaths>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let stringified: BTreeMap<String, FOVResultPaths> = BTreeMap::deserialize(deserializer)?;
        stringified
            .into_iter()
            .map(|(fov, paths)| {
                fov.parse::<usize>()
                    .map(|fov| (fov, paths))
                    .map_err(|e| D::Error::custom(format!("non-numeric FOV key {fov:?}: {e}")))
            })
            .collect()
    }
}

impl ResultCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_fov(&mut self, fov: usize) -> &mut FOVResultPaths {
        self.results.entry(fov).or_default()
    }

    pub fn set_pc(&mut self, fov: usize, channel: usize, path: PathBuf) {
        let entry = self.ensure_fov(fov);
        if entry.pc.is_none() {
            entry.pc = Some((channel, path));
        }
    }

    pub fn add_fl(&mut self, fov: usize, channel: usize, path: PathBuf) {
        let entry = self.ensure_fov(fov);
        FOVResultPaths::add_unique(&mut entry.fl, channel, path);
    }

    pub fn set_seg(&mut self, fov: usize, channel: usize, path: PathBuf) {
        let entry = self.ensure_fov(fov);
        if entry.seg.is_none() {
            entry.seg = Some((channel, path));
        }
    }

    pub fn set_seg_labeled(&mut self, fov: usize, channel: usize, path: PathBuf) {
        let entry = self.ensure_fov(fov);
        if entry.seg_labeled.is_none() {
            entry.seg_labeled = Some((channel, path));
        }
    }

    pub fn add_fl_background(&mut self, fov: usize, channel: usize, path: PathBuf) {
        let entry = self.ensure_fov(fov);
        FOVResultPaths::add_unique(&mut entry.fl_background, channel, path);
    }

    pub fn set_traces(&mut self, fov: usize, path: PathBuf) {
        let entry = self.ensure_fov(fov);
        if entry.traces.is_none() {
            entry.traces = Some(path);
        }
    }

    /// Merge `other` into `self`: first-writer-wins scalars, idempotent
    /// set-union list fields. Commutative and associative, so the order in
    /// which worker catalogs complete does not matter.
    pub fn merge(&mut self, other: &ResultCatalog) {
        if self.output_dir.is_none() {
            self.output_dir = other.output_dir.clone();
        }
        if self.channels.is_none() {
            self.channels = other.channels.clone();
        }
        if self.time_units.is_none() {
            self.time_units = other.time_units.clone();
        }
        for (key, value) in &other.params {
            self.params.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for (fov, child_entry) in &other.results {
            self.results.entry(*fov).or_default().merge_from(child_entry);
        }
    }

    pub fn to_yaml(&self) -> crate::error::Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| crate::error::PipelineError::NumericFailure(e.to_string()))
    }

    pub fn from_yaml(s: &str) -> crate::error::Result<Self> {
        serde_yaml::from_str(s)
            .map_err(|e| crate::error::PipelineError::NumericFailure(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_fields_are_first_writer_wins() {
        let mut a = ResultCatalog::new();
        a.set_pc(0, 0, "a/pc.zarr".into());
        let mut b = ResultCatalog::new();
        b.set_pc(0, 1, "b/pc.zarr".into());

        a.merge(&b);
        assert_eq!(a.results[&0].pc, Some((0, PathBuf::from("a/pc.zarr"))));
    }

    #[test]
    fn list_fields_are_idempotent_set_union() {
        let mut a = ResultCatalog::new();
        a.add_fl(0, 1, "fl1.zarr".into());
        let mut b = ResultCatalog::new();
        b.add_fl(0, 1, "fl1.zarr".into());
        b.add_fl(0, 2, "fl2.zarr".into());

        a.merge(&b);
        assert_eq!(a.results[&0].fl.len(), 2);

        // merging again must not duplicate.
        a.merge(&b);
        assert_eq!(a.results[&0].fl.len(), 2);
    }

    #[test]
    fn merge_is_commutative_for_list_fields() {
        let mut a = ResultCatalog::new();
        a.add_fl(0, 1, "fl1.zarr".into());
        let mut b = ResultCatalog::new();
        b.add_fl(0, 2, "fl2.zarr".into());

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab.results[&0].fl.len(), ba.results[&0].fl.len());
    }

    #[test]
    fn merging_a_childs_extra_fl_channel_yields_the_union() {
        let mut parent = ResultCatalog::new();
        parent.add_fl(0, 0, "/a.bin".into());
        let mut child = ResultCatalog::new();
        child.add_fl(0, 0, "/a.bin".into());
        child.add_fl(0, 1, "/b.bin".into());

        parent.merge(&child);
        let fl = &parent.results[&0].fl;
        assert_eq!(fl.len(), 2);
        assert!(fl.contains(&(0, PathBuf::from("/a.bin"))));
        assert!(fl.contains(&(1, PathBuf::from("/b.bin"))));
    }

    #[test]
    fn round_trips_through_yaml() {
        let mut cat = ResultCatalog::new();
        cat.output_dir = Some("/out".into());
        cat.channels = Some(CatalogChannels {
            pc: Some(0),
            fl: vec![1, 2],
        });
        cat.set_seg(3, 0, "fov_0003/seg.zarr".into());
        cat.set_traces(3, "fov_0003/traces.csv".into());

        let yaml = cat.to_yaml().unwrap();
        let back = ResultCatalog::from_yaml(&yaml).unwrap();
        assert_eq!(back.output_dir, cat.output_dir);
        assert_eq!(back.results[&3].traces, cat.results[&3].traces);
    }

    #[test]
    fn fov_keys_are_quoted_strings_on_disk() {
        let mut cat = ResultCatalog::new();
        cat.set_traces(0, "fov_0000/traces.csv".into());
        cat.set_traces(12, "fov_0012/traces.csv".into());

        let yaml = cat.to_yaml().unwrap();
        let docs: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let results = docs.get("results").unwrap().as_mapping().unwrap();
        for key in results.keys() {
            assert!(key.is_string(), "expected string key, got {key:?}");
        }
        assert!(results.contains_key(serde_yaml::Value::String("0".into())));
        assert!(results.contains_key(serde_yaml::Value::String("12".into())));
    }
}

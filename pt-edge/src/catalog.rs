use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, RwLock},
};

use runner_abi::{ExecutionMode, ExecutionStage, ImageKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::logging::category_catalog;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("duplicate id {0} in catalog")]
    DuplicateId(Uuid),
    #[error("type {type_id} references unknown assembly {assembly_id}")]
    OrphanType { type_id: Uuid, assembly_id: Uuid },
    #[error("step {step_id} references unknown type {type_id}")]
    OrphanStep { step_id: Uuid, type_id: Uuid },
    #[error("image {image_id} references unknown step {step_id}")]
    OrphanImage { image_id: Uuid, step_id: Uuid },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssemblyRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub sandboxed: bool,
    #[serde(default)]
    pub managed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeRecord {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub type_name: String,
    pub assembly_id: Uuid,
    #[serde(default)]
    pub assembly_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: Uuid,
    pub type_id: Uuid,
    #[serde(default)]
    pub name: String,
    pub operation: String,
    #[serde(default)]
    pub entity: String,
    pub stage: ExecutionStage,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub rank: i32,
    #[serde(default)]
    pub filtering_fields: Vec<String>,
    #[serde(default)]
    pub secure_config: Option<String>,
    #[serde(default)]
    pub unsecure_config: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: Uuid,
    pub step_id: Uuid,
    pub kind: ImageKind,
    pub alias: String,
    /// Empty means every field.
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Registration catalog as fetched from the platform. Immutable once
/// installed; a refresh replaces it wholesale.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub assemblies: Vec<AssemblyRecord>,
    #[serde(default)]
    pub types: Vec<TypeRecord>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
}

impl CatalogSnapshot {
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        let ids = self
            .assemblies
            .iter()
            .map(|record| record.id)
            .chain(self.types.iter().map(|record| record.id))
            .chain(self.steps.iter().map(|record| record.id))
            .chain(self.images.iter().map(|record| record.id));
        for id in ids {
            if !seen.insert(id) {
                return Err(CatalogError::DuplicateId(id));
            }
        }

        let assemblies: HashSet<Uuid> = self.assemblies.iter().map(|record| record.id).collect();
        if let Some(orphan) = self
            .types
            .iter()
            .find(|record| !assemblies.contains(&record.assembly_id))
        {
            return Err(CatalogError::OrphanType {
                type_id: orphan.id,
                assembly_id: orphan.assembly_id,
            });
        }

        let types: HashSet<Uuid> = self.types.iter().map(|record| record.id).collect();
        if let Some(orphan) = self
            .steps
            .iter()
            .find(|record| !types.contains(&record.type_id))
        {
            return Err(CatalogError::OrphanStep {
                step_id: orphan.id,
                type_id: orphan.type_id,
            });
        }

        let steps: HashSet<Uuid> = self.steps.iter().map(|record| record.id).collect();
        if let Some(orphan) = self
            .images
            .iter()
            .find(|record| !steps.contains(&record.step_id))
        {
            return Err(CatalogError::OrphanImage {
                image_id: orphan.id,
                step_id: orphan.step_id,
            });
        }
        Ok(())
    }

    /// Builds a snapshot from raw records, dropping anything whose owner is
    /// missing so the result always validates.
    pub fn from_records(
        assemblies: Vec<AssemblyRecord>,
        types: Vec<TypeRecord>,
        steps: Vec<StepRecord>,
        images: Vec<ImageRecord>,
    ) -> Self {
        let assembly_names: HashMap<Uuid, String> = assemblies
            .iter()
            .map(|record| (record.id, record.name.clone()))
            .collect();

        let (types, orphan_types): (Vec<_>, Vec<_>) = types
            .into_iter()
            .partition(|record| assembly_names.contains_key(&record.assembly_id));
        let types: Vec<TypeRecord> = types
            .into_iter()
            .map(|mut record| {
                if record.assembly_name.is_empty()
                    && let Some(name) = assembly_names.get(&record.assembly_id)
                {
                    record.assembly_name = name.clone();
                }
                record
            })
            .collect();

        let type_ids: HashSet<Uuid> = types.iter().map(|record| record.id).collect();
        let (steps, orphan_steps): (Vec<_>, Vec<_>) = steps
            .into_iter()
            .partition(|record| type_ids.contains(&record.type_id));

        let step_ids: HashSet<Uuid> = steps.iter().map(|record| record.id).collect();
        let (images, orphan_images): (Vec<_>, Vec<_>) = images
            .into_iter()
            .partition(|record| step_ids.contains(&record.step_id));

        if !orphan_types.is_empty() || !orphan_steps.is_empty() || !orphan_images.is_empty() {
            warn!(
                "{} dropped orphaned records types={} steps={} images={}",
                category_catalog(),
                orphan_types.len(),
                orphan_steps.len(),
                orphan_images.len()
            );
        }

        Self {
            assemblies,
            types,
            steps,
            images,
        }
    }
}

/// Splits a comma separated field list into lowercase names.
pub fn parse_field_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|field| field.trim().to_ascii_lowercase())
        .filter(|field| !field.is_empty())
        .collect()
}

/// Which assemblies are treated as locally debuggable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AssemblySelection {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl AssemblySelection {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        AssemblySelection::Only(
            names
                .into_iter()
                .map(|name| name.as_ref().trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
        )
    }

    pub fn includes(&self, assembly_name: &str) -> bool {
        match self {
            AssemblySelection::All => true,
            AssemblySelection::Only(names) => names.contains(&assembly_name.to_ascii_lowercase()),
        }
    }

    pub fn names(&self) -> Option<Vec<String>> {
        match self {
            AssemblySelection::All => None,
            AssemblySelection::Only(names) => Some(names.iter().cloned().collect()),
        }
    }
}

/// Matcher-facing projection of a step and its owning type.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepInfo {
    pub step_id: Uuid,
    pub type_id: Uuid,
    pub name: String,
    pub assembly_name: String,
    pub type_name: String,
    pub operation: String,
    pub entity: String,
    pub stage: ExecutionStage,
    pub mode: ExecutionMode,
    pub rank: i32,
    pub filtering_fields: Vec<String>,
    pub secure_config: Option<String>,
    pub unsecure_config: Option<String>,
    pub images: Vec<ImageRecord>,
}

impl StepInfo {
    /// Target entity, with the platform's `none` placeholder treated as empty.
    pub fn target_entity(&self) -> &str {
        if self.entity.eq_ignore_ascii_case("none") {
            ""
        } else {
            &self.entity
        }
    }

    pub fn pre_images(&self) -> impl Iterator<Item = &ImageRecord> {
        self.images.iter().filter(|image| image.kind.includes_pre())
    }

    pub fn post_images(&self) -> impl Iterator<Item = &ImageRecord> {
        self.images.iter().filter(|image| image.kind.includes_post())
    }

    pub fn label(&self) -> String {
        format!(
            "{} {}:{} ({} {} rank {})",
            self.type_name,
            self.operation,
            if self.target_entity().is_empty() {
                "any"
            } else {
                self.target_entity()
            },
            self.stage.as_str(),
            self.mode.as_str(),
            self.rank
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSummary {
    pub assemblies: usize,
    pub types: usize,
    pub steps: usize,
    pub images: usize,
    pub indexed_steps: usize,
    pub handler_types: usize,
    pub selection: Option<Vec<String>>,
}

/// Query-optimized, read-only view over one snapshot and one assembly
/// selection.
pub struct CatalogIndex {
    snapshot: Arc<CatalogSnapshot>,
    selection: AssemblySelection,
    steps: Vec<StepInfo>,
    by_operation: HashMap<String, Vec<usize>>,
    by_type: HashMap<Uuid, Vec<usize>>,
}

impl CatalogIndex {
    pub fn build(snapshot: Arc<CatalogSnapshot>, selection: AssemblySelection) -> Self {
        let types: HashMap<Uuid, &TypeRecord> = snapshot
            .types
            .iter()
            .map(|record| (record.id, record))
            .collect();
        let assemblies: HashMap<Uuid, &str> = snapshot
            .assemblies
            .iter()
            .map(|record| (record.id, record.name.as_str()))
            .collect();
        let mut images: HashMap<Uuid, Vec<ImageRecord>> = HashMap::new();
        for image in &snapshot.images {
            images.entry(image.step_id).or_default().push(image.clone());
        }

        let mut steps = Vec::with_capacity(snapshot.steps.len());
        for step in &snapshot.steps {
            let Some(owner) = types.get(&step.type_id) else {
                continue;
            };
            let assembly_name = assemblies
                .get(&owner.assembly_id)
                .copied()
                .unwrap_or(owner.assembly_name.as_str());
            if !selection.includes(assembly_name) {
                continue;
            }
            steps.push(StepInfo {
                step_id: step.id,
                type_id: owner.id,
                name: step.name.clone(),
                assembly_name: assembly_name.to_string(),
                type_name: owner.type_name.clone(),
                operation: step.operation.clone(),
                entity: step.entity.to_ascii_lowercase(),
                stage: step.stage,
                mode: step.mode,
                rank: step.rank,
                filtering_fields: step
                    .filtering_fields
                    .iter()
                    .map(|field| field.trim().to_ascii_lowercase())
                    .filter(|field| !field.is_empty())
                    .collect(),
                secure_config: step.secure_config.clone(),
                unsecure_config: step.unsecure_config.clone(),
                images: images.remove(&step.id).unwrap_or_default(),
            });
        }

        let mut by_operation: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_type: HashMap<Uuid, Vec<usize>> = HashMap::new();
        for (position, step) in steps.iter().enumerate() {
            by_operation
                .entry(step.operation.to_ascii_lowercase())
                .or_default()
                .push(position);
            by_type.entry(step.type_id).or_default().push(position);
        }

        Self {
            snapshot,
            selection,
            steps,
            by_operation,
            by_type,
        }
    }

    pub fn empty() -> Self {
        Self::build(Arc::new(CatalogSnapshot::default()), AssemblySelection::All)
    }

    pub fn snapshot(&self) -> &Arc<CatalogSnapshot> {
        &self.snapshot
    }

    pub fn selection(&self) -> &AssemblySelection {
        &self.selection
    }

    pub fn steps(&self) -> &[StepInfo] {
        &self.steps
    }

    pub fn step(&self, step_id: Uuid) -> Option<&StepInfo> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    /// Steps registered under any of `names`, each at most once, in catalog
    /// order.
    pub fn steps_for_operation(&self, names: &[String]) -> Vec<&StepInfo> {
        let positions: BTreeSet<usize> = names
            .iter()
            .filter_map(|name| self.by_operation.get(&name.to_ascii_lowercase()))
            .flatten()
            .copied()
            .collect();
        positions
            .into_iter()
            .map(|position| &self.steps[position])
            .collect()
    }

    pub fn steps_for_type(&self, type_id: Uuid) -> Vec<&StepInfo> {
        self.by_type
            .get(&type_id)
            .map(|positions| positions.iter().map(|&position| &self.steps[position]).collect())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> CatalogSummary {
        CatalogSummary {
            assemblies: self.snapshot.assemblies.len(),
            types: self.snapshot.types.len(),
            steps: self.snapshot.steps.len(),
            images: self.snapshot.images.len(),
            indexed_steps: self.steps.len(),
            handler_types: self.by_type.len(),
            selection: self.selection.names(),
        }
    }
}

/// Holds the published index. Readers clone the `Arc` and keep a consistent
/// view for as long as they need it.
pub struct CatalogStore {
    current: RwLock<Arc<CatalogIndex>>,
}

impl CatalogStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogIndex::empty())),
        }
    }

    pub fn current(&self) -> Arc<CatalogIndex> {
        self.current
            .read()
            .expect("catalog lock poisoned")
            .clone()
    }

    pub fn install(&self, snapshot: CatalogSnapshot) -> Result<CatalogSummary, CatalogError> {
        snapshot.validate()?;
        let mut guard = self.current.write().expect("catalog lock poisoned");
        let index = CatalogIndex::build(Arc::new(snapshot), guard.selection().clone());
        let summary = index.summary();
        *guard = Arc::new(index);
        info!(
            "{} installed catalog assemblies={} types={} steps={} images={} indexed_steps={}",
            category_catalog(),
            summary.assemblies,
            summary.types,
            summary.steps,
            summary.images,
            summary.indexed_steps
        );
        Ok(summary)
    }

    pub fn select(&self, selection: AssemblySelection) -> CatalogSummary {
        let mut guard = self.current.write().expect("catalog lock poisoned");
        let index = CatalogIndex::build(guard.snapshot().clone(), selection);
        let summary = index.summary();
        *guard = Arc::new(index);
        info!(
            "{} assembly selection changed selection={:?} indexed_steps={}",
            category_catalog(),
            summary.selection,
            summary.indexed_steps
        );
        summary
    }
}

impl Default for CatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct CatalogBuilder {
        snapshot: CatalogSnapshot,
        assembly_id: Uuid,
        type_id: Uuid,
    }

    impl CatalogBuilder {
        pub(crate) fn new(assembly: &str, type_name: &str) -> Self {
            let assembly_id = Uuid::new_v4();
            let type_id = Uuid::new_v4();
            Self {
                snapshot: CatalogSnapshot {
                    assemblies: vec![AssemblyRecord {
                        id: assembly_id,
                        name: assembly.to_string(),
                        version: "1.0.0.0".to_string(),
                        sandboxed: true,
                        managed: false,
                    }],
                    types: vec![TypeRecord {
                        id: type_id,
                        name: type_name.to_string(),
                        type_name: type_name.to_string(),
                        assembly_id,
                        assembly_name: assembly.to_string(),
                    }],
                    steps: Vec::new(),
                    images: Vec::new(),
                },
                assembly_id,
                type_id,
            }
        }

        pub(crate) fn second_assembly(mut self, assembly: &str, type_name: &str) -> Self {
            self.assembly_id = Uuid::new_v4();
            self.type_id = Uuid::new_v4();
            self.snapshot.assemblies.push(AssemblyRecord {
                id: self.assembly_id,
                name: assembly.to_string(),
                version: "1.0.0.0".to_string(),
                sandboxed: true,
                managed: false,
            });
            self.snapshot.types.push(TypeRecord {
                id: self.type_id,
                name: type_name.to_string(),
                type_name: type_name.to_string(),
                assembly_id: self.assembly_id,
                assembly_name: assembly.to_string(),
            });
            self
        }

        pub(crate) fn step(
            mut self,
            operation: &str,
            entity: &str,
            stage: ExecutionStage,
            filtering: &str,
        ) -> Self {
            self.push_step(operation, entity, stage, ExecutionMode::Synchronous, 1, filtering);
            self
        }

        pub(crate) fn push_step(
            &mut self,
            operation: &str,
            entity: &str,
            stage: ExecutionStage,
            mode: ExecutionMode,
            rank: i32,
            filtering: &str,
        ) -> Uuid {
            let id = Uuid::new_v4();
            self.snapshot.steps.push(StepRecord {
                id,
                type_id: self.type_id,
                name: format!("{operation} of {entity}"),
                operation: operation.to_string(),
                entity: entity.to_string(),
                stage,
                mode,
                rank,
                filtering_fields: parse_field_list(filtering),
                secure_config: None,
                unsecure_config: None,
            });
            id
        }

        pub(crate) fn image(mut self, kind: ImageKind, alias: &str, fields: &str) -> Self {
            let step_id = self
                .snapshot
                .steps
                .last()
                .map(|step| step.id)
                .expect("image needs a step");
            self.snapshot.images.push(ImageRecord {
                id: Uuid::new_v4(),
                step_id,
                kind,
                alias: alias.to_string(),
                fields: parse_field_list(fields),
            });
            self
        }

        pub(crate) fn snapshot(self) -> CatalogSnapshot {
            self.snapshot
        }

        pub(crate) fn index(self) -> CatalogIndex {
            CatalogIndex::build(Arc::new(self.snapshot), AssemblySelection::All)
        }
    }

    #[test]
    fn validate_rejects_orphans() {
        let mut snapshot = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.AccountUpdate")
            .step("Update", "account", ExecutionStage::PreOperation, "")
            .image(ImageKind::Pre, "pre", "name")
            .snapshot();
        assert!(snapshot.validate().is_ok());

        let missing = Uuid::new_v4();
        snapshot.images[0].step_id = missing;
        assert_eq!(
            snapshot.validate(),
            Err(CatalogError::OrphanImage {
                image_id: snapshot.images[0].id,
                step_id: missing
            })
        );

        snapshot.images.clear();
        snapshot.steps[0].type_id = missing;
        assert!(matches!(
            snapshot.validate(),
            Err(CatalogError::OrphanStep { .. })
        ));
    }

    #[test]
    fn from_records_drops_orphans_and_fills_assembly_names() {
        let snapshot = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.A")
            .step("Create", "contact", ExecutionStage::PostOperation, "")
            .snapshot();
        let mut types = snapshot.types.clone();
        types[0].assembly_name.clear();
        let mut steps = snapshot.steps.clone();
        steps.push(StepRecord {
            type_id: Uuid::new_v4(),
            id: Uuid::new_v4(),
            ..steps[0].clone()
        });
        let rebuilt = CatalogSnapshot::from_records(snapshot.assemblies.clone(), types, steps, Vec::new());

        assert_eq!(rebuilt.steps.len(), 1);
        assert_eq!(rebuilt.types[0].assembly_name, "Contoso.Plugins");
        assert!(rebuilt.validate().is_ok());
    }

    #[test]
    fn index_groups_by_operation_and_type() {
        let mut builder = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.A");
        let update = builder.push_step(
            "Update",
            "account",
            ExecutionStage::PreOperation,
            ExecutionMode::Synchronous,
            1,
            "",
        );
        builder.push_step(
            "myaction",
            "",
            ExecutionStage::PostOperation,
            ExecutionMode::Synchronous,
            1,
            "",
        );
        let index = builder.index();

        let found = index.steps_for_operation(&["UPDATE".to_string(), "update".to_string()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].step_id, update);
        assert_eq!(index.steps_for_type(found[0].type_id).len(), 2);
        assert_eq!(index.summary().handler_types, 1);
    }

    #[test]
    fn selection_limits_indexed_steps() {
        let snapshot = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.A")
            .step("Update", "account", ExecutionStage::PreOperation, "")
            .second_assembly("Fabrikam.Plugins", "Fabrikam.Plugins.B")
            .step("Update", "account", ExecutionStage::PreOperation, "")
            .snapshot();
        let store = CatalogStore::new();
        let summary = store.install(snapshot).expect("catalog should install");
        assert_eq!(summary.indexed_steps, 2);

        let summary = store.select(AssemblySelection::only(["contoso.plugins"]));
        assert_eq!(summary.indexed_steps, 1);
        assert_eq!(
            store.current().steps()[0].assembly_name,
            "Contoso.Plugins"
        );

        let summary = store.select(AssemblySelection::only(Vec::<String>::new()));
        assert_eq!(summary.indexed_steps, 0);
        assert_eq!(summary.steps, 2);
    }

    #[test]
    fn readers_keep_their_snapshot_across_installs() {
        let store = CatalogStore::new();
        let before = store.current();
        store
            .install(
                CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.A")
                    .step("Update", "account", ExecutionStage::PreOperation, "")
                    .snapshot(),
            )
            .expect("catalog should install");
        assert!(before.steps().is_empty());
        assert_eq!(store.current().steps().len(), 1);
    }

    #[test]
    fn install_rejects_invalid_snapshot_and_keeps_previous() {
        let store = CatalogStore::new();
        let mut snapshot = CatalogBuilder::new("Contoso.Plugins", "Contoso.Plugins.A")
            .step("Update", "account", ExecutionStage::PreOperation, "")
            .snapshot();
        snapshot.steps[0].type_id = Uuid::new_v4();
        assert!(store.install(snapshot).is_err());
        assert!(store.current().steps().is_empty());
    }

    #[test]
    fn field_lists_are_normalized() {
        assert_eq!(parse_field_list(" Name, telephone1 ,,"), vec!["name", "telephone1"]);
        assert!(parse_field_list("").is_empty());
    }
}

//! File-backed persistence for the planning kernel: the entity catalog YAML,
//! the three relationship-matrix CSVs, the append-only `NNN.step` snapshot
//! files, and the observation log.
//!
//! The core stays pure; everything that touches disk lives here.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use planning_kernel_core::{
    ConsensusOutcome, EdgeKind, EntityCatalog, EntityClass, EntityRecord, GenerationSnapshot,
    MatrixStore, Observation, RelationMatrix, ScoreMap, Strength,
};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Entity catalog file name inside a planning directory.
pub const CATALOG_FILE: &str = "product-planning.yaml";

/// Unknown-relationship marker written to scaffolded matrix cells.
pub const UNKNOWN_CELL: &str = "~";

/// A matrix cell whose text parsed to no strength on the {0,1,3,5} scale.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct CellWarning {
    pub file: String,
    pub row_key: String,
    pub column_code: String,
    pub raw: String,
}

/// Result of loading all three matrices: the validated store plus any
/// malformed-cell warnings (the cells themselves load as no-relationship).
#[derive(Debug)]
pub struct MatrixLoad {
    pub store: MatrixStore,
    pub warnings: Vec<CellWarning>,
}

/// Summary of one matrix CSV written by scaffolding or populating.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct MatrixFileReport {
    pub file: String,
    pub rows: usize,
    pub columns: usize,
    pub filled_cells: usize,
}

/// Parsed observation log plus per-line warnings for rows that could not be
/// turned into observations.
#[derive(Debug)]
pub struct ObservationLoad {
    pub observations: Vec<Observation>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepFile {
    step: u32,
    description: String,
    problems: ScoreMap,
    needs: ScoreMap,
    features: ScoreMap,
}

impl From<&GenerationSnapshot> for StepFile {
    fn from(snapshot: &GenerationSnapshot) -> Self {
        Self {
            step: snapshot.generation,
            description: snapshot.description.clone(),
            problems: snapshot.problems.clone(),
            needs: snapshot.needs.clone(),
            features: snapshot.features.clone(),
        }
    }
}

impl From<StepFile> for GenerationSnapshot {
    fn from(file: StepFile) -> Self {
        Self {
            generation: file.step,
            description: file.description,
            problems: file.problems,
            needs: file.needs,
            features: file.features,
        }
    }
}

/// Handle to one planning directory. All paths are resolved relative to it.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open an existing planning directory.
    ///
    /// # Errors
    /// Fails when the directory does not exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            bail!("planning directory {} does not exist", root.display());
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    #[must_use]
    pub fn matrix_path(&self, edge: EdgeKind) -> PathBuf {
        self.root.join(format!("{edge}.csv"))
    }

    #[must_use]
    pub fn step_path(&self, generation: u32) -> PathBuf {
        self.root.join(format!("{generation:03}.step"))
    }

    /// Load the entity catalog, preserving YAML document order as catalog
    /// order.
    ///
    /// # Errors
    /// Fails on a missing or malformed file, non-mapping sections, or
    /// duplicate keys within a class.
    pub fn load_catalog(&self) -> Result<EntityCatalog> {
        let path = self.catalog_path();
        let body = fs::read_to_string(&path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        let document: Value = serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse catalog {}", path.display()))?;

        let problems = class_section(&document, "problems")?;
        let needs = class_section(&document, "needs")?;
        let features = class_section(&document, "features")?;

        EntityCatalog::new(problems, needs, features)
            .with_context(|| format!("invalid catalog {}", path.display()))
    }

    /// Load all three matrix CSVs against the catalog.
    ///
    /// # Errors
    /// Fails on missing files, header/column-code mismatches, or row keys
    /// absent from the catalog. Malformed cells are not fatal; they load as
    /// no-relationship and come back as warnings.
    pub fn load_matrices(&self, catalog: &EntityCatalog) -> Result<MatrixLoad> {
        let mut warnings = Vec::new();
        let mut load = |edge| -> Result<RelationMatrix> {
            let path = self.matrix_path(edge);
            let body = fs::read_to_string(&path)
                .with_context(|| format!("failed to read matrix {}", path.display()))?;
            let (matrix, mut file_warnings) = parse_matrix(edge, catalog, &body, &file_name(&path))
                .with_context(|| format!("failed to parse matrix {}", path.display()))?;
            warnings.append(&mut file_warnings);
            Ok(matrix)
        };

        let problem_to_need = load(EdgeKind::ProblemToNeed)?;
        let need_to_feature = load(EdgeKind::NeedToFeature)?;
        let feature_to_problem = load(EdgeKind::FeatureToProblem)?;

        let store = MatrixStore::new(problem_to_need, need_to_feature, feature_to_problem)?;
        Ok(MatrixLoad { store, warnings })
    }

    /// Scaffold or refresh all three matrix CSVs from the catalog. Cells
    /// already present in an existing file are carried over verbatim; new
    /// cells default to the unknown marker. No key is ever dropped or
    /// invented.
    ///
    /// # Errors
    /// Fails when an existing file cannot be read or the new file cannot be
    /// written.
    pub fn scaffold_matrices(&self, catalog: &EntityCatalog) -> Result<Vec<MatrixFileReport>> {
        let mut reports = Vec::new();
        for edge in EdgeKind::ALL {
            let path = self.matrix_path(edge);
            let existing = if path.exists() {
                let body = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read matrix {}", path.display()))?;
                existing_cells(&body)
            } else {
                BTreeMap::new()
            };

            let mut filled = 0;
            let body = render_matrix(edge, catalog, |row_key, code| {
                match existing.get(&(row_key.to_string(), code.to_string())) {
                    Some(value) if value != UNKNOWN_CELL => {
                        filled += 1;
                        value.clone()
                    }
                    _ => UNKNOWN_CELL.to_string(),
                }
            });
            fs::write(&path, body)
                .with_context(|| format!("failed to write matrix {}", path.display()))?;

            reports.push(MatrixFileReport {
                file: file_name(&path),
                rows: catalog.members(edge.row_class()).len(),
                columns: catalog.members(edge.column_class()).len(),
                filled_cells: filled,
            });
        }
        Ok(reports)
    }

    /// Rewrite all three matrix CSVs from a consensus outcome. With
    /// `show_counts`, cells backed by more than one observation are written
    /// as `strength(count)`.
    ///
    /// # Errors
    /// Fails when a file cannot be written.
    pub fn write_consensus_matrices(
        &self,
        catalog: &EntityCatalog,
        outcome: &ConsensusOutcome,
        show_counts: bool,
    ) -> Result<Vec<MatrixFileReport>> {
        let mut by_edge: BTreeMap<EdgeKind, BTreeMap<(String, String), (Strength, usize)>> =
            BTreeMap::new();
        for cell in &outcome.cells {
            by_edge
                .entry(cell.edge)
                .or_default()
                .insert((cell.from_key.clone(), cell.to_key.clone()), (cell.strength, cell.votes));
        }

        let mut reports = Vec::new();
        for edge in EdgeKind::ALL {
            let cells = by_edge.get(&edge);
            let mut filled = 0;
            let body = render_matrix(edge, catalog, |row_key, code| {
                let col_key = catalog.key_for_code(edge.column_class(), code).unwrap_or(code);
                let cell =
                    cells.and_then(|cells| cells.get(&(row_key.to_string(), col_key.to_string())));
                match cell {
                    Some((strength, votes)) if *strength != Strength::None => {
                        filled += 1;
                        if show_counts && *votes > 1 {
                            format!("{}({votes})", strength.weight())
                        } else {
                            strength.weight().to_string()
                        }
                    }
                    _ => UNKNOWN_CELL.to_string(),
                }
            });
            let path = self.matrix_path(edge);
            fs::write(&path, body)
                .with_context(|| format!("failed to write matrix {}", path.display()))?;

            reports.push(MatrixFileReport {
                file: file_name(&path),
                rows: catalog.members(edge.row_class()).len(),
                columns: catalog.members(edge.column_class()).len(),
                filled_cells: filled,
            });
        }
        Ok(reports)
    }

    /// Parse an observation log CSV. Lines that cannot become observations
    /// are reported, not fatal; key validation against the catalog happens
    /// later in consensus.
    ///
    /// # Errors
    /// Fails only when the file itself cannot be read.
    pub fn load_observations(&self, path: &Path) -> Result<ObservationLoad> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read observation log {}", path.display()))?;

        let mut observations = Vec::new();
        let mut warnings = Vec::new();
        for (index, line) in body.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.starts_with("relationship_type") {
                continue;
            }

            // Evidence is the free-text tail, so only the first five commas
            // delimit fields.
            let fields: Vec<&str> = trimmed.splitn(6, ',').collect();
            if fields.len() < 5 {
                warnings.push(format!("line {line_no}: expected at least 5 fields"));
                continue;
            }

            let edge_text = fields.first().map_or("", |field| field.trim());
            let Some(edge) = EdgeKind::parse(edge_text) else {
                warnings
                    .push(format!("line {line_no}: unrecognized relationship type {edge_text}"));
                continue;
            };

            let strength_text = fields.get(3).map_or("", |field| field.trim());
            let strength = strength_text
                .parse::<u32>()
                .ok()
                .and_then(Strength::from_raw);
            let Some(strength) = strength else {
                warnings.push(format!(
                    "line {line_no}: strength {strength_text} is not on the 0/1/3/5 scale"
                ));
                continue;
            };

            observations.push(Observation {
                edge,
                from_key: fields.get(1).map_or("", |field| field.trim()).to_string(),
                to_key: fields.get(2).map_or("", |field| field.trim()).to_string(),
                strength,
                observer: fields.get(4).map_or("", |field| field.trim()).to_string(),
                evidence: fields.get(5).map_or("", |field| field.trim()).to_string(),
            });
        }

        Ok(ObservationLoad { observations, warnings })
    }

    /// Persist a generation snapshot as `NNN.step`. Step files are
    /// append-only on disk; an existing file for the same generation is
    /// never overwritten.
    ///
    /// # Errors
    /// Fails when the file already exists or cannot be written.
    pub fn save_step(&self, snapshot: &GenerationSnapshot) -> Result<PathBuf> {
        let path = self.step_path(snapshot.generation);
        if path.exists() {
            bail!("refusing to overwrite existing step file {}", path.display());
        }
        let body = serde_yaml::to_string(&StepFile::from(snapshot))
            .context("failed to serialize step file")?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write step file {}", path.display()))?;
        Ok(path)
    }

    /// Load the snapshot for one generation.
    ///
    /// # Errors
    /// Fails when the file is missing or malformed, or records a different
    /// generation than its name claims.
    pub fn load_step(&self, generation: u32) -> Result<GenerationSnapshot> {
        let path = self.step_path(generation);
        let body = fs::read_to_string(&path)
            .with_context(|| format!("failed to read step file {}", path.display()))?;
        let file: StepFile = serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse step file {}", path.display()))?;
        if file.step != generation {
            bail!(
                "step file {} records generation {} instead of {generation}",
                path.display(),
                file.step
            );
        }
        Ok(file.into())
    }

    /// Highest generation with a step file on disk, if any.
    ///
    /// # Errors
    /// Fails when the planning directory cannot be listed.
    pub fn latest_generation(&self) -> Result<Option<u32>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to list planning directory {}", self.root.display()))?;

        let mut latest = None;
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to list planning directory {}", self.root.display())
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(generation) = parse_step_name(name) {
                latest = latest.max(Some(generation));
            }
        }
        Ok(latest)
    }

    /// Load the most recent snapshot on disk.
    ///
    /// # Errors
    /// Fails when no step file exists or the latest one cannot be loaded.
    pub fn latest_step(&self) -> Result<GenerationSnapshot> {
        let generation = self
            .latest_generation()?
            .ok_or_else(|| anyhow!("no step files in {}", self.root.display()))?;
        self.load_step(generation)
    }
}

fn parse_step_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".step")?;
    if stem.len() != 3 || !stem.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(|| path.display().to_string(), |name| {
        name.to_string_lossy().into_owned()
    })
}

fn class_title(class: EntityClass) -> &'static str {
    match class {
        EntityClass::Problem => "Problem",
        EntityClass::Need => "Need",
        EntityClass::Feature => "Feature",
    }
}

fn class_section(document: &Value, name: &str) -> Result<Vec<EntityRecord>> {
    let Some(section) = document.get(name) else {
        return Ok(Vec::new());
    };
    let mapping = section
        .as_mapping()
        .ok_or_else(|| anyhow!("catalog section `{name}` must be a mapping"))?;

    let mut records = Vec::new();
    for (key, value) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| anyhow!("catalog section `{name}` has a non-string key"))?;
        let title = value
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(key)
            .to_string();
        let description = value
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        records.push(EntityRecord { key: key.to_string(), title, description });
    }
    Ok(records)
}

fn parse_matrix(
    edge: EdgeKind,
    catalog: &EntityCatalog,
    body: &str,
    file: &str,
) -> Result<(RelationMatrix, Vec<CellWarning>)> {
    let mut lines = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));

    let header = lines.next().ok_or_else(|| anyhow!("matrix has no header row"))?;
    let header_fields: Vec<&str> = header.split(',').map(str::trim).collect();
    let row_label = class_title(edge.row_class()).to_uppercase();
    let (codes, label) = header_fields
        .split_last()
        .map(|(label, codes)| (codes, *label))
        .ok_or_else(|| anyhow!("matrix header is empty"))?;
    if label != row_label {
        bail!("matrix header must end with {row_label}, found {label}");
    }

    let expected = catalog.column_codes(edge.column_class());
    if codes != expected.as_slice() {
        bail!(
            "matrix column codes do not match the catalog: expected {}, found {}",
            expected.join(","),
            codes.join(",")
        );
    }

    let mut matrix = RelationMatrix::new(edge, catalog);
    let mut warnings = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let (row_key, cells) = fields
            .split_last()
            .ok_or_else(|| anyhow!("matrix data row is empty"))?;
        if cells.len() != expected.len() {
            bail!("matrix row {row_key} has {} cells, expected {}", cells.len(), expected.len());
        }

        for (code, raw) in expected.iter().zip(cells) {
            let strength = match Strength::parse_cell(raw) {
                Some(strength) => strength,
                None => {
                    warnings.push(CellWarning {
                        file: file.to_string(),
                        row_key: (*row_key).to_string(),
                        column_code: code.clone(),
                        raw: (*raw).to_string(),
                    });
                    Strength::None
                }
            };
            let col_key = catalog
                .key_for_code(edge.column_class(), code)
                .ok_or_else(|| anyhow!("column code {code} resolves to no catalog key"))?;
            matrix.set(row_key, col_key, strength)?;
        }
    }

    Ok((matrix, warnings))
}

/// Cell values of an existing matrix file, keyed by (row key, column code).
/// Lenient by design: scaffolding must never lose a value it cannot parse.
fn existing_cells(body: &str) -> BTreeMap<(String, String), String> {
    let mut lines = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));

    let Some(header) = lines.next() else {
        return BTreeMap::new();
    };
    let header_fields: Vec<&str> = header.split(',').map(str::trim).collect();
    let Some((_, codes)) = header_fields.split_last() else {
        return BTreeMap::new();
    };

    let mut cells = BTreeMap::new();
    for line in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let Some((row_key, values)) = fields.split_last() else {
            continue;
        };
        for (code, value) in codes.iter().zip(values) {
            cells.insert(((*row_key).to_string(), (*code).to_string()), (*value).to_string());
        }
    }
    cells
}

/// Render one matrix CSV: commented column-code legend, header row with the
/// row dimension last, one padded data row per row entity in catalog order.
fn render_matrix(
    edge: EdgeKind,
    catalog: &EntityCatalog,
    mut cell: impl FnMut(&str, &str) -> String,
) -> String {
    let column_class = edge.column_class();
    let codes = catalog.column_codes(column_class);
    let row_label = class_title(edge.row_class()).to_uppercase();

    let mut body = String::new();
    body.push_str(&format!("# {} Mapping:\n", class_title(column_class)));
    for (member, code) in catalog.members(column_class).iter().zip(&codes) {
        body.push_str(&format!("# {code}: {} - {}\n", member.key, member.description));
    }
    body.push_str("#\n");
    body.push_str(
        "# Interaction strength values: 5 (strong), 3 (medium), 1 (weak), ~ (none/unknown)\n",
    );
    let generated_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("unknown"));
    body.push_str(&format!("# Generated: {generated_at}\n"));
    body.push_str("#\n");

    body.push_str(&codes.join(","));
    body.push(',');
    body.push_str(&row_label);
    body.push('\n');

    for member in catalog.members(edge.row_class()) {
        for code in &codes {
            body.push_str(&format!(" {} ,", cell(&member.key, code)));
        }
        body.push_str(&member.key);
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use planning_kernel_core::{compute_generation, resolve_consensus};

    use super::*;

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
        fs::create_dir_all(&dir)
            .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
        dir
    }

    const CATALOG_YAML: &str = "\
problems:
  slow-reporting:
    title: Reporting is slow
    description: Weekly reports take hours to assemble
  manual-triage:
    title: Triage is manual
    description: Incoming items are sorted by hand
needs:
  fast-summaries:
    title: Fast summaries
    description: Summaries available in minutes
  stable-history:
    title: Stable history
    description: Past decisions stay retrievable
features:
  digest-view:
    title: Digest view
    description: One-page digest of recent activity
  timeline:
    title: Timeline
    description: Chronological record of events
";

    fn fixture_store(prefix: &str) -> FileStore {
        let dir = unique_temp_dir(prefix);
        let catalog_path = dir.join(CATALOG_FILE);
        fs::write(&catalog_path, CATALOG_YAML).unwrap_or_else(|err| {
            panic!("failed to write catalog {}: {err}", catalog_path.display())
        });
        match FileStore::open(&dir) {
            Ok(store) => store,
            Err(err) => panic!("failed to open fixture store: {err}"),
        }
    }

    fn load_catalog(store: &FileStore) -> EntityCatalog {
        match store.load_catalog() {
            Ok(catalog) => catalog,
            Err(err) => panic!("fixture catalog should load: {err}"),
        }
    }

    fn write_matrix(store: &FileStore, edge: EdgeKind, body: &str) {
        let path = store.matrix_path(edge);
        fs::write(&path, body)
            .unwrap_or_else(|err| panic!("failed to write matrix {}: {err}", path.display()));
    }

    fn scaffold(store: &FileStore, catalog: &EntityCatalog) -> Vec<MatrixFileReport> {
        match store.scaffold_matrices(catalog) {
            Ok(reports) => reports,
            Err(err) => panic!("scaffolding should succeed: {err}"),
        }
    }

    #[test]
    fn catalog_preserves_document_order() {
        let store = fixture_store("planningkernel-catalog");
        let catalog = load_catalog(&store);

        let problems: Vec<&str> = catalog.keys(EntityClass::Problem).collect();
        assert_eq!(problems, vec!["slow-reporting", "manual-triage"]);
        let features: Vec<&str> = catalog.keys(EntityClass::Feature).collect();
        assert_eq!(features, vec!["digest-view", "timeline"]);

        let record = match catalog.record(EntityClass::Need, "stable-history") {
            Some(record) => record,
            None => panic!("catalog should contain stable-history"),
        };
        assert_eq!(record.title, "Stable history");
    }

    #[test]
    fn missing_catalog_is_a_readable_error() {
        let dir = unique_temp_dir("planningkernel-nocatalog");
        let store = match FileStore::open(&dir) {
            Ok(store) => store,
            Err(err) => panic!("empty dir should open: {err}"),
        };
        let err = match store.load_catalog() {
            Ok(_) => panic!("missing catalog should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("failed to read catalog"));
    }

    #[test]
    fn matrix_parsing_handles_comments_markers_and_annotations() {
        let store = fixture_store("planningkernel-parse");
        let catalog = load_catalog(&store);
        write_matrix(
            &store,
            EdgeKind::ProblemToNeed,
            "# Need Mapping:\n\
             # N00: fast-summaries - Summaries available in minutes\n\
             #\n\
             N00,N01,PROBLEM\n\
             \x20 5 , 3(2) ,slow-reporting\n\
             \x20 ~ , 1 ,manual-triage\n",
        );

        let body = match fs::read_to_string(store.matrix_path(EdgeKind::ProblemToNeed)) {
            Ok(body) => body,
            Err(err) => panic!("matrix should read back: {err}"),
        };
        let (matrix, warnings) = match parse_matrix(
            EdgeKind::ProblemToNeed,
            &catalog,
            &body,
            "problem-to-need.csv",
        ) {
            Ok(parsed) => parsed,
            Err(err) => panic!("matrix should parse: {err}"),
        };

        assert!(warnings.is_empty());
        assert_eq!(matrix.strength_of("slow-reporting", "fast-summaries"), Strength::Strong);
        assert_eq!(matrix.strength_of("slow-reporting", "stable-history"), Strength::Medium);
        assert_eq!(matrix.strength_of("manual-triage", "fast-summaries"), Strength::None);
        assert_eq!(matrix.strength_of("manual-triage", "stable-history"), Strength::Weak);
    }

    #[test]
    fn malformed_cells_warn_with_coordinates_and_load_as_none() {
        let store = fixture_store("planningkernel-warn");
        let catalog = load_catalog(&store);
        write_matrix(
            &store,
            EdgeKind::ProblemToNeed,
            "N00,N01,PROBLEM\n 5 , x ,slow-reporting\n ~ , ~ ,manual-triage\n",
        );
        write_matrix(&store, EdgeKind::NeedToFeature, "F00,F01,NEED\n ~ , ~ ,fast-summaries\n");
        write_matrix(&store, EdgeKind::FeatureToProblem, "P00,P01,FEATURE\n ~ , ~ ,digest-view\n");

        let load = match store.load_matrices(&catalog) {
            Ok(load) => load,
            Err(err) => panic!("matrices should load: {err}"),
        };

        assert_eq!(load.warnings.len(), 1);
        assert_eq!(load.warnings[0].row_key, "slow-reporting");
        assert_eq!(load.warnings[0].column_code, "N01");
        assert_eq!(load.warnings[0].raw, "x");
        let matrix = load.store.matrix(EdgeKind::ProblemToNeed);
        assert_eq!(matrix.strength_of("slow-reporting", "stable-history"), Strength::None);
    }

    #[test]
    fn orphan_row_keys_are_fatal() {
        let store = fixture_store("planningkernel-orphan");
        let catalog = load_catalog(&store);
        write_matrix(
            &store,
            EdgeKind::ProblemToNeed,
            "N00,N01,PROBLEM\n 5 , ~ ,no-such-problem\n",
        );
        write_matrix(&store, EdgeKind::NeedToFeature, "F00,F01,NEED\n");
        write_matrix(&store, EdgeKind::FeatureToProblem, "P00,P01,FEATURE\n");

        let err = match store.load_matrices(&catalog) {
            Ok(_) => panic!("orphan row key should be fatal"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("unknown problem key: no-such-problem"));
    }

    #[test]
    fn column_code_mismatch_is_fatal() {
        let store = fixture_store("planningkernel-codes");
        let catalog = load_catalog(&store);
        write_matrix(&store, EdgeKind::ProblemToNeed, "N00,N01,N02,PROBLEM\n");
        write_matrix(&store, EdgeKind::NeedToFeature, "F00,F01,NEED\n");
        write_matrix(&store, EdgeKind::FeatureToProblem, "P00,P01,FEATURE\n");

        let err = match store.load_matrices(&catalog) {
            Ok(_) => panic!("column code mismatch should be fatal"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("column codes do not match"));
    }

    #[test]
    fn scaffolding_creates_and_then_preserves_cells() {
        let store = fixture_store("planningkernel-scaffold");
        let catalog = load_catalog(&store);

        let reports = scaffold(&store, &catalog);
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|report| report.filled_cells == 0));
        assert_eq!(reports[0].rows, 2);
        assert_eq!(reports[0].columns, 2);

        // Fill one cell by hand, rescaffold, and expect it to survive.
        write_matrix(
            &store,
            EdgeKind::NeedToFeature,
            "F00,F01,NEED\n 5 , ~ ,fast-summaries\n ~ , 3 ,stable-history\n",
        );
        let reports = scaffold(&store, &catalog);
        let n2f = reports
            .iter()
            .find(|report| report.file == "need-to-feature.csv")
            .unwrap_or_else(|| panic!("need-to-feature report missing"));
        assert_eq!(n2f.filled_cells, 2);

        let load = match store.load_matrices(&catalog) {
            Ok(load) => load,
            Err(err) => panic!("scaffolded matrices should load: {err}"),
        };
        let matrix = load.store.matrix(EdgeKind::NeedToFeature);
        assert_eq!(matrix.strength_of("fast-summaries", "digest-view"), Strength::Strong);
        assert_eq!(matrix.strength_of("stable-history", "timeline"), Strength::Medium);
    }

    #[test]
    fn observation_log_parses_and_round_trips_through_consensus() {
        let store = fixture_store("planningkernel-observe");
        let catalog = load_catalog(&store);

        let log_path = store.root().join("observation-log.csv");
        fs::write(
            &log_path,
            "# Observation log\n\
             relationship_type,from_item,to_item,strength,observer,evidence\n\
             problem-to-need,slow-reporting,fast-summaries,5,alice,weekly report took 4 hours\n\
             problem-to-need,slow-reporting,fast-summaries,5,bob,sprint review feedback\n\
             problem-to-need,slow-reporting,fast-summaries,3,carol,partial automation exists\n\
             problem-exists,slow-reporting,,,dave,initial report\n\
             need-to-feature,stable-history,timeline,7,erin,bad strength\n",
        )
        .unwrap_or_else(|err| panic!("failed to write log {}: {err}", log_path.display()));

        let load = match store.load_observations(&log_path) {
            Ok(load) => load,
            Err(err) => panic!("observation log should load: {err}"),
        };
        assert_eq!(load.observations.len(), 3);
        assert_eq!(load.warnings.len(), 2);

        let outcome = resolve_consensus(&catalog, &load.observations);
        let reports = match store.write_consensus_matrices(&catalog, &outcome, true) {
            Ok(reports) => reports,
            Err(err) => panic!("consensus matrices should write: {err}"),
        };
        let p2n = reports
            .iter()
            .find(|report| report.file == "problem-to-need.csv")
            .unwrap_or_else(|| panic!("problem-to-need report missing"));
        assert_eq!(p2n.filled_cells, 1);

        // The annotated cell parses back to its consensus strength.
        let loaded = match store.load_matrices(&catalog) {
            Ok(load) => load,
            Err(err) => panic!("populated matrices should load: {err}"),
        };
        assert!(loaded.warnings.is_empty());
        let matrix = loaded.store.matrix(EdgeKind::ProblemToNeed);
        assert_eq!(matrix.strength_of("slow-reporting", "fast-summaries"), Strength::Strong);
    }

    #[test]
    fn step_files_round_trip_and_refuse_overwrite() {
        let store = fixture_store("planningkernel-steps");
        let catalog = load_catalog(&store);
        scaffold(&store, &catalog);
        write_matrix(
            &store,
            EdgeKind::ProblemToNeed,
            "N00,N01,PROBLEM\n 5 , 3 ,slow-reporting\n ~ , 1 ,manual-triage\n",
        );

        let load = match store.load_matrices(&catalog) {
            Ok(load) => load,
            Err(err) => panic!("matrices should load: {err}"),
        };
        let snapshot = match compute_generation(&catalog, &load.store, None, 1) {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("generation 1 should compute: {err}"),
        };

        let path = match store.save_step(&snapshot) {
            Ok(path) => path,
            Err(err) => panic!("step should save: {err}"),
        };
        assert!(path.ends_with("001.step"));

        let loaded = match store.load_step(1) {
            Ok(loaded) => loaded,
            Err(err) => panic!("step should load: {err}"),
        };
        assert_eq!(loaded, snapshot);

        let err = match store.save_step(&snapshot) {
            Ok(_) => panic!("second save should be refused"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("refusing to overwrite"));
    }

    #[test]
    fn latest_step_scans_generation_indices() {
        let store = fixture_store("planningkernel-latest");
        assert!(matches!(store.latest_generation(), Ok(None)));

        for generation in 1..=3 {
            let snapshot = GenerationSnapshot {
                generation,
                description: format!("round {generation}"),
                problems: ScoreMap::new(),
                needs: ScoreMap::new(),
                features: ScoreMap::new(),
            };
            if let Err(err) = store.save_step(&snapshot) {
                panic!("step {generation} should save: {err}");
            }
        }
        // Unrelated files are ignored by the scan.
        let stray = store.root().join("notes.txt");
        fs::write(&stray, "scratch")
            .unwrap_or_else(|err| panic!("failed to write {}: {err}", stray.display()));

        let latest = match store.latest_step() {
            Ok(latest) => latest,
            Err(err) => panic!("latest step should load: {err}"),
        };
        assert_eq!(latest.generation, 3);
        assert_eq!(latest.description, "round 3");
    }

    #[test]
    fn mismatched_step_payload_is_rejected() {
        let store = fixture_store("planningkernel-mismatch");
        let path = store.step_path(2);
        fs::write(&path, "step: 1\ndescription: wrong\nproblems: {}\nneeds: {}\nfeatures: {}\n")
            .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));

        let err = match store.load_step(2) {
            Ok(_) => panic!("mismatched step file should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("records generation 1 instead of 2"));
    }
}

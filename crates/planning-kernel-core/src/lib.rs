use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PlanningError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("generation {requested} requires generation {missing} to be computed first")]
    MissingGeneration { requested: u32, missing: u32 },
    #[error("generation {0} is already recorded in the ledger")]
    DuplicateGeneration(u32),
}

/// One of the three node classes of the propagation cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    Problem,
    Need,
    Feature,
}

impl EntityClass {
    pub const ALL: [Self; 3] = [Self::Problem, Self::Need, Self::Feature];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Problem => "problem",
            Self::Need => "need",
            Self::Feature => "feature",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "problem" => Some(Self::Problem),
            "need" => Some(Self::Need),
            "feature" => Some(Self::Feature),
            _ => None,
        }
    }

    /// Next class along the Problem -> Need -> Feature -> Problem cycle.
    #[must_use]
    pub fn downstream(self) -> Self {
        match self {
            Self::Problem => Self::Need,
            Self::Need => Self::Feature,
            Self::Feature => Self::Problem,
        }
    }

    /// Previous class along the cycle.
    #[must_use]
    pub fn upstream(self) -> Self {
        match self {
            Self::Problem => Self::Feature,
            Self::Need => Self::Problem,
            Self::Feature => Self::Need,
        }
    }

    /// Edge whose matrix has this class as row owner.
    #[must_use]
    pub fn row_edge(self) -> EdgeKind {
        match self {
            Self::Problem => EdgeKind::ProblemToNeed,
            Self::Need => EdgeKind::NeedToFeature,
            Self::Feature => EdgeKind::FeatureToProblem,
        }
    }

    /// Edge whose matrix has this class as column owner.
    #[must_use]
    pub fn column_edge(self) -> EdgeKind {
        self.upstream().row_edge()
    }

    /// Ordinal column-code prefix used by the tabular matrix format.
    #[must_use]
    pub fn code_prefix(self) -> char {
        match self {
            Self::Problem => 'P',
            Self::Need => 'N',
            Self::Feature => 'F',
        }
    }
}

impl Display for EntityClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed identity of one of the three relationship matrices.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    ProblemToNeed,
    NeedToFeature,
    FeatureToProblem,
}

impl EdgeKind {
    pub const ALL: [Self; 3] = [Self::ProblemToNeed, Self::NeedToFeature, Self::FeatureToProblem];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProblemToNeed => "problem-to-need",
            Self::NeedToFeature => "need-to-feature",
            Self::FeatureToProblem => "feature-to-problem",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "problem-to-need" => Some(Self::ProblemToNeed),
            "need-to-feature" => Some(Self::NeedToFeature),
            "feature-to-problem" => Some(Self::FeatureToProblem),
            _ => None,
        }
    }

    #[must_use]
    pub fn row_class(self) -> EntityClass {
        match self {
            Self::ProblemToNeed => EntityClass::Problem,
            Self::NeedToFeature => EntityClass::Need,
            Self::FeatureToProblem => EntityClass::Feature,
        }
    }

    #[must_use]
    pub fn column_class(self) -> EntityClass {
        self.row_class().downstream()
    }
}

impl Display for EdgeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discrete interaction strength between two entities in adjacent classes.
///
/// `None` means "no relationship", not "unknown"; the tabular format's
/// unknown marker parses to `None` as well.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    None,
    Weak,
    Medium,
    Strong,
}

impl Strength {
    #[must_use]
    pub fn weight(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Weak => 1,
            Self::Medium => 3,
            Self::Strong => 5,
        }
    }

    /// Accepts only the discrete scale {0, 1, 3, 5}.
    #[must_use]
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Weak),
            3 => Some(Self::Medium),
            5 => Some(Self::Strong),
            _ => None,
        }
    }

    /// Parse one tabular cell. The leading token before any observation-count
    /// annotation decides the strength, so cells like `5(3)` still parse.
    /// Returns `None` (the Option) for malformed cells so callers can surface
    /// a data-quality warning instead of silently zeroing them.
    #[must_use]
    pub fn parse_cell(raw: &str) -> Option<Self> {
        let token = raw.split_whitespace().next().unwrap_or("");
        let token = token.split('(').next().unwrap_or("");
        match token {
            "5" => Some(Self::Strong),
            "3" => Some(Self::Medium),
            "1" => Some(Self::Weak),
            "0" | "~" | "---" | "" => Some(Self::None),
            _ => Option::None,
        }
    }
}

/// One configured entity. Metadata is owned by the configuration
/// collaborator; the core never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntityRecord {
    pub key: String,
    pub title: String,
    pub description: String,
}

/// The three entity key sets in declared order. Declared order is load-bearing:
/// it defines ordinal column codes and breaks ranking ties.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EntityCatalog {
    problems: Vec<EntityRecord>,
    needs: Vec<EntityRecord>,
    features: Vec<EntityRecord>,
}

impl EntityCatalog {
    /// Build a catalog from the three declared entity lists.
    ///
    /// # Errors
    /// Returns [`PlanningError::Configuration`] when a class contains a
    /// duplicate or empty key.
    pub fn new(
        problems: Vec<EntityRecord>,
        needs: Vec<EntityRecord>,
        features: Vec<EntityRecord>,
    ) -> Result<Self, PlanningError> {
        for (class, members) in
            [(EntityClass::Problem, &problems), (EntityClass::Need, &needs), (EntityClass::Feature, &features)]
        {
            let mut seen = BTreeSet::new();
            for member in members {
                if member.key.trim().is_empty() {
                    return Err(PlanningError::Configuration(format!(
                        "{class} entity key must be non-empty"
                    )));
                }
                if !seen.insert(member.key.as_str()) {
                    return Err(PlanningError::Configuration(format!(
                        "duplicate {class} key: {}",
                        member.key
                    )));
                }
            }
        }

        Ok(Self { problems, needs, features })
    }

    #[must_use]
    pub fn members(&self, class: EntityClass) -> &[EntityRecord] {
        match class {
            EntityClass::Problem => &self.problems,
            EntityClass::Need => &self.needs,
            EntityClass::Feature => &self.features,
        }
    }

    pub fn keys(&self, class: EntityClass) -> impl Iterator<Item = &str> {
        self.members(class).iter().map(|member| member.key.as_str())
    }

    #[must_use]
    pub fn contains(&self, class: EntityClass, key: &str) -> bool {
        self.position(class, key).is_some()
    }

    #[must_use]
    pub fn position(&self, class: EntityClass, key: &str) -> Option<usize> {
        self.members(class).iter().position(|member| member.key == key)
    }

    #[must_use]
    pub fn record(&self, class: EntityClass, key: &str) -> Option<&EntityRecord> {
        self.members(class).iter().find(|member| member.key == key)
    }

    /// Ordinal column codes (`N00`, `N01`, ...) for a class, in declared order.
    #[must_use]
    pub fn column_codes(&self, class: EntityClass) -> Vec<String> {
        let prefix = class.code_prefix();
        (0..self.members(class).len()).map(|index| format!("{prefix}{index:02}")).collect()
    }

    /// Resolve an ordinal column code back to the declared key.
    #[must_use]
    pub fn key_for_code(&self, class: EntityClass, code: &str) -> Option<&str> {
        let rest = code.strip_prefix(class.code_prefix())?;
        let index: usize = rest.parse().ok()?;
        self.members(class).get(index).map(|member| member.key.as_str())
    }
}

/// Per-class mapping from entity key to a non-negative score.
pub type ScoreMap = BTreeMap<String, f64>;

/// Sparse table of directed weighted relationships for one edge of the cycle.
/// Read-only during scoring; all mutation happens at construction time.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RelationMatrix {
    edge: EdgeKind,
    row_keys: Vec<String>,
    col_keys: Vec<String>,
    cells: BTreeMap<(usize, usize), Strength>,
}

impl RelationMatrix {
    /// Create an empty matrix whose row and column key sets are the
    /// catalog's declared sets for this edge.
    #[must_use]
    pub fn new(edge: EdgeKind, catalog: &EntityCatalog) -> Self {
        Self {
            edge,
            row_keys: catalog.keys(edge.row_class()).map(str::to_string).collect(),
            col_keys: catalog.keys(edge.column_class()).map(str::to_string).collect(),
            cells: BTreeMap::new(),
        }
    }

    /// Create a matrix from explicit cells, rejecting orphan keys.
    ///
    /// # Errors
    /// Returns [`PlanningError::Configuration`] when a cell references a key
    /// absent from the declared entity sets.
    pub fn from_cells<I>(
        edge: EdgeKind,
        catalog: &EntityCatalog,
        cells: I,
    ) -> Result<Self, PlanningError>
    where
        I: IntoIterator<Item = (String, String, Strength)>,
    {
        let mut matrix = Self::new(edge, catalog);
        for (row_key, col_key, strength) in cells {
            matrix.set(&row_key, &col_key, strength)?;
        }
        Ok(matrix)
    }

    /// Record one cell, validating both keys against the declared sets.
    ///
    /// # Errors
    /// Returns [`PlanningError::Configuration`] for orphan row or column keys.
    pub fn set(&mut self, row_key: &str, col_key: &str, strength: Strength) -> Result<(), PlanningError> {
        let row = self.row_keys.iter().position(|key| key == row_key).ok_or_else(|| {
            PlanningError::Configuration(format!(
                "{} matrix references unknown {} key: {row_key}",
                self.edge,
                self.edge.row_class()
            ))
        })?;
        let col = self.col_keys.iter().position(|key| key == col_key).ok_or_else(|| {
            PlanningError::Configuration(format!(
                "{} matrix references unknown {} key: {col_key}",
                self.edge,
                self.edge.column_class()
            ))
        })?;

        if strength == Strength::None {
            self.cells.remove(&(row, col));
        } else {
            self.cells.insert((row, col), strength);
        }
        Ok(())
    }

    #[must_use]
    pub fn edge(&self) -> EdgeKind {
        self.edge
    }

    #[must_use]
    pub fn row_keys(&self) -> &[String] {
        &self.row_keys
    }

    #[must_use]
    pub fn column_keys(&self) -> &[String] {
        &self.col_keys
    }

    /// Interaction strength for one cell; absent cells are `Strength::None`.
    #[must_use]
    pub fn strength_of(&self, row_key: &str, col_key: &str) -> Strength {
        let row = self.row_keys.iter().position(|key| key == row_key);
        let col = self.col_keys.iter().position(|key| key == col_key);
        match (row, col) {
            (Some(row), Some(col)) => self.cells.get(&(row, col)).copied().unwrap_or(Strength::None),
            _ => Strength::None,
        }
    }

    #[must_use]
    pub fn row_sum(&self, row_key: &str) -> u32 {
        let Some(row) = self.row_keys.iter().position(|key| key == row_key) else {
            return 0;
        };
        self.cells
            .range((row, 0)..=(row, self.col_keys.len().saturating_sub(1)))
            .map(|(_, strength)| strength.weight())
            .sum()
    }

    #[must_use]
    pub fn col_sum(&self, col_key: &str) -> u32 {
        let Some(col) = self.col_keys.iter().position(|key| key == col_key) else {
            return 0;
        };
        self.cells
            .iter()
            .filter(|((_, cell_col), _)| *cell_col == col)
            .map(|(_, strength)| strength.weight())
            .sum()
    }

    /// `Σ_col columnWeights[col] × strength(row, col)`; missing weights are 0.
    #[must_use]
    pub fn weighted_row_sum(&self, row_key: &str, column_weights: &ScoreMap) -> f64 {
        let Some(row) = self.row_keys.iter().position(|key| key == row_key) else {
            return 0.0;
        };
        self.cells
            .range((row, 0)..=(row, self.col_keys.len().saturating_sub(1)))
            .map(|((_, col), strength)| {
                let weight = column_weights.get(&self.col_keys[*col]).copied().unwrap_or(0.0);
                weight * f64::from(strength.weight())
            })
            .sum()
    }

    /// `Σ_row rowWeights[row] × strength(row, col)`; missing weights are 0.
    #[must_use]
    pub fn weighted_col_sum(&self, col_key: &str, row_weights: &ScoreMap) -> f64 {
        let Some(col) = self.col_keys.iter().position(|key| key == col_key) else {
            return 0.0;
        };
        self.cells
            .iter()
            .filter(|((_, cell_col), _)| *cell_col == col)
            .map(|((row, _), strength)| {
                let weight = row_weights.get(&self.row_keys[*row]).copied().unwrap_or(0.0);
                weight * f64::from(strength.weight())
            })
            .sum()
    }
}

/// The three matrices chained in the fixed cycle. The cyclic invariant holds
/// by construction: each class owns rows in exactly one field and columns in
/// exactly one other.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MatrixStore {
    problem_to_need: RelationMatrix,
    need_to_feature: RelationMatrix,
    feature_to_problem: RelationMatrix,
}

impl MatrixStore {
    /// Assemble the store from the three matrices.
    ///
    /// # Errors
    /// Returns [`PlanningError::Configuration`] when a matrix was built for a
    /// different edge than the field it is assigned to.
    pub fn new(
        problem_to_need: RelationMatrix,
        need_to_feature: RelationMatrix,
        feature_to_problem: RelationMatrix,
    ) -> Result<Self, PlanningError> {
        for (expected, matrix) in [
            (EdgeKind::ProblemToNeed, &problem_to_need),
            (EdgeKind::NeedToFeature, &need_to_feature),
            (EdgeKind::FeatureToProblem, &feature_to_problem),
        ] {
            if matrix.edge() != expected {
                return Err(PlanningError::Configuration(format!(
                    "matrix store slot {expected} was given a {} matrix",
                    matrix.edge()
                )));
            }
        }

        Ok(Self { problem_to_need, need_to_feature, feature_to_problem })
    }

    #[must_use]
    pub fn matrix(&self, edge: EdgeKind) -> &RelationMatrix {
        match edge {
            EdgeKind::ProblemToNeed => &self.problem_to_need,
            EdgeKind::NeedToFeature => &self.need_to_feature,
            EdgeKind::FeatureToProblem => &self.feature_to_problem,
        }
    }

    /// Matrix in which `class` is the row owner.
    #[must_use]
    pub fn row_matrix(&self, class: EntityClass) -> &RelationMatrix {
        self.matrix(class.row_edge())
    }

    /// Matrix in which `class` is the column owner.
    #[must_use]
    pub fn column_matrix(&self, class: EntityClass) -> &RelationMatrix {
        self.matrix(class.column_edge())
    }
}

/// Normalize raw scores to a relative-percentage distribution summing to 100.
/// A fully zero class normalizes to all zeros rather than dividing by zero.
#[must_use]
pub fn relative(raw: &ScoreMap) -> ScoreMap {
    let total: f64 = raw.values().sum();
    if total == 0.0 {
        return raw.keys().map(|key| (key.clone(), 0.0)).collect();
    }
    raw.iter().map(|(key, value)| (key.clone(), value / total * 100.0)).collect()
}

/// One frozen round of importance propagation across all three classes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationSnapshot {
    pub generation: u32,
    pub description: String,
    pub problems: ScoreMap,
    pub needs: ScoreMap,
    pub features: ScoreMap,
}

impl GenerationSnapshot {
    #[must_use]
    pub fn class_scores(&self, class: EntityClass) -> &ScoreMap {
        match class {
            EntityClass::Problem => &self.problems,
            EntityClass::Need => &self.needs,
            EntityClass::Feature => &self.features,
        }
    }
}

/// Append-only, index-addressable log of generation snapshots. Generation N
/// can only be appended once generation N-1 is present, which is exactly the
/// sequencing invariant the propagation needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationLedger {
    snapshots: Vec<GenerationSnapshot>,
}

impl GenerationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Random access by generation index (1-based).
    #[must_use]
    pub fn get(&self, generation: u32) -> Option<&GenerationSnapshot> {
        let index = usize::try_from(generation.checked_sub(1)?).ok()?;
        self.snapshots.get(index)
    }

    #[must_use]
    pub fn latest(&self) -> Option<&GenerationSnapshot> {
        self.snapshots.last()
    }

    /// Append the next snapshot in sequence.
    ///
    /// # Errors
    /// Returns [`PlanningError::DuplicateGeneration`] when the generation is
    /// already recorded, or [`PlanningError::MissingGeneration`] when the
    /// snapshot would leave a gap.
    pub fn append(&mut self, snapshot: GenerationSnapshot) -> Result<(), PlanningError> {
        let next = u32::try_from(self.snapshots.len()).map_err(|_| {
            PlanningError::Configuration("ledger length exceeds u32 range".to_string())
        })? + 1;

        match snapshot.generation.cmp(&next) {
            Ordering::Less => Err(PlanningError::DuplicateGeneration(snapshot.generation)),
            Ordering::Greater => Err(PlanningError::MissingGeneration {
                requested: snapshot.generation,
                missing: next,
            }),
            Ordering::Equal => {
                self.snapshots.push(snapshot);
                Ok(())
            }
        }
    }

    /// Compute the next generation from the matrix store and append it.
    ///
    /// # Errors
    /// Propagates any configuration error from the propagation itself.
    pub fn advance(
        &mut self,
        catalog: &EntityCatalog,
        store: &MatrixStore,
        description: String,
    ) -> Result<&GenerationSnapshot, PlanningError> {
        let next = u32::try_from(self.snapshots.len()).map_err(|_| {
            PlanningError::Configuration("ledger length exceeds u32 range".to_string())
        })? + 1;
        let mut snapshot = compute_generation(catalog, store, self.latest(), next)?;
        if !description.is_empty() {
            snapshot.description = description;
        }
        self.append(snapshot)?;
        self.snapshots.last().ok_or_else(|| {
            PlanningError::Configuration("ledger append produced no snapshot".to_string())
        })
    }
}

fn direct_class_scores(catalog: &EntityCatalog, store: &MatrixStore, class: EntityClass) -> ScoreMap {
    let row_matrix = store.row_matrix(class);
    let column_matrix = store.column_matrix(class);
    catalog
        .keys(class)
        .map(|key| {
            let raw = row_matrix.row_sum(key) + column_matrix.col_sum(key);
            (key.to_string(), f64::from(raw))
        })
        .collect()
}

fn weighted_class_scores(
    catalog: &EntityCatalog,
    store: &MatrixStore,
    class: EntityClass,
    previous: &GenerationSnapshot,
) -> ScoreMap {
    let row_matrix = store.row_matrix(class);
    let column_matrix = store.column_matrix(class);
    let downstream_weights = previous.class_scores(class.downstream());
    let upstream_weights = previous.class_scores(class.upstream());

    catalog
        .keys(class)
        .map(|key| {
            let raw = row_matrix.weighted_row_sum(key, downstream_weights)
                + column_matrix.weighted_col_sum(key, upstream_weights);
            (key.to_string(), raw)
        })
        .collect()
}

/// Compute one generation snapshot.
///
/// Generation 1 sums rows and columns directly from the matrices; generation
/// N uses generation N-1's normalized percentages as weights. The three class
/// computations read only the previous snapshot, never each other, so they
/// could fan out in parallel; the result is identical either way.
///
/// # Errors
/// Returns [`PlanningError::MissingGeneration`] when `generation > 1` and
/// `previous` is absent or is not generation `generation - 1`, and
/// [`PlanningError::Configuration`] for a generation index of 0.
pub fn compute_generation(
    catalog: &EntityCatalog,
    store: &MatrixStore,
    previous: Option<&GenerationSnapshot>,
    generation: u32,
) -> Result<GenerationSnapshot, PlanningError> {
    if generation == 0 {
        return Err(PlanningError::Configuration("generation index must be >= 1".to_string()));
    }

    let raw: [ScoreMap; 3] = if generation == 1 {
        EntityClass::ALL.map(|class| direct_class_scores(catalog, store, class))
    } else {
        let previous = previous.ok_or(PlanningError::MissingGeneration {
            requested: generation,
            missing: generation - 1,
        })?;
        if previous.generation != generation - 1 {
            return Err(PlanningError::MissingGeneration {
                requested: generation,
                missing: generation - 1,
            });
        }
        EntityClass::ALL.map(|class| weighted_class_scores(catalog, store, class, previous))
    };

    let [problems, needs, features] = raw;
    Ok(GenerationSnapshot {
        generation,
        description: format!("Relative importance scores for generation {generation}"),
        problems: relative(&problems),
        needs: relative(&needs),
        features: relative(&features),
    })
}

/// Largest absolute per-key percentage change between two adjacent snapshots.
/// Diagnostic only; the propagation never gates on it.
#[must_use]
pub fn convergence_delta(previous: &GenerationSnapshot, next: &GenerationSnapshot) -> f64 {
    let mut delta: f64 = 0.0;
    for class in EntityClass::ALL {
        let before = previous.class_scores(class);
        let after = next.class_scores(class);
        for (key, value) in after {
            let prior = before.get(key).copied().unwrap_or(0.0);
            delta = delta.max((value - prior).abs());
        }
        for (key, value) in before {
            if !after.contains_key(key) {
                delta = delta.max(value.abs());
            }
        }
    }
    delta
}

/// One upstream contributor in a justification report. `supported_by` nests
/// the next hop upstream, one level deep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contribution {
    pub key: String,
    pub title: String,
    pub strength: u32,
    pub importance: f64,
    pub contribution: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_by: Vec<Contribution>,
}

/// Ranked backward attribution for one target entity: who justifies its
/// importance, one and two hops back around the cycle, plus any direct
/// two-hop relationships the cycle provides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JustificationReport {
    pub class: EntityClass,
    pub key: String,
    pub title: String,
    pub score: f64,
    pub upstream: Vec<Contribution>,
    pub direct: Vec<Contribution>,
}

fn rank_contributions(contributions: &mut [Contribution]) {
    // Stable sort keeps catalog order for equal contributions.
    contributions.sort_by(|lhs, rhs| {
        rhs.contribution.partial_cmp(&lhs.contribution).unwrap_or(Ordering::Equal)
    });
}

fn upstream_contributions(
    catalog: &EntityCatalog,
    store: &MatrixStore,
    snapshot: &GenerationSnapshot,
    class: EntityClass,
    key: &str,
    nest: bool,
) -> Vec<Contribution> {
    let upstream_class = class.upstream();
    let matrix = store.column_matrix(class);
    let scores = snapshot.class_scores(upstream_class);

    let mut contributions = Vec::new();
    for member in catalog.members(upstream_class) {
        let strength = matrix.strength_of(&member.key, key);
        if strength == Strength::None {
            continue;
        }
        let importance = scores.get(&member.key).copied().unwrap_or(0.0);
        let supported_by = if nest {
            upstream_contributions(catalog, store, snapshot, upstream_class, &member.key, false)
        } else {
            Vec::new()
        };
        contributions.push(Contribution {
            key: member.key.clone(),
            title: member.title.clone(),
            strength: strength.weight(),
            importance,
            contribution: f64::from(strength.weight()) * importance,
            supported_by,
        });
    }
    rank_contributions(&mut contributions);
    contributions
}

fn direct_contributions(
    catalog: &EntityCatalog,
    store: &MatrixStore,
    snapshot: &GenerationSnapshot,
    class: EntityClass,
    key: &str,
) -> Vec<Contribution> {
    let direct_class = class.downstream();
    let matrix = store.row_matrix(class);
    let scores = snapshot.class_scores(direct_class);

    let mut contributions = Vec::new();
    for member in catalog.members(direct_class) {
        let strength = matrix.strength_of(key, &member.key);
        if strength == Strength::None {
            continue;
        }
        let importance = scores.get(&member.key).copied().unwrap_or(0.0);
        contributions.push(Contribution {
            key: member.key.clone(),
            title: member.title.clone(),
            strength: strength.weight(),
            importance,
            contribution: f64::from(strength.weight()) * importance,
            supported_by: Vec::new(),
        });
    }
    rank_contributions(&mut contributions);
    contributions
}

/// Trace a target entity's importance backward through the matrix cycle.
///
/// Pure read: identical inputs always yield identical ranked output,
/// including tie order (catalog declaration order).
///
/// # Errors
/// Returns [`PlanningError::Configuration`] when the target key is not part
/// of the configured entity set for its class.
pub fn justify(
    catalog: &EntityCatalog,
    store: &MatrixStore,
    snapshot: &GenerationSnapshot,
    class: EntityClass,
    key: &str,
) -> Result<JustificationReport, PlanningError> {
    let record = catalog.record(class, key).ok_or_else(|| {
        PlanningError::Configuration(format!("unknown {class} key: {key}"))
    })?;

    let upstream = upstream_contributions(catalog, store, snapshot, class, key, true);
    let direct = direct_contributions(catalog, store, snapshot, class, key);

    Ok(JustificationReport {
        class,
        key: record.key.clone(),
        title: record.title.clone(),
        score: snapshot.class_scores(class).get(key).copied().unwrap_or(0.0),
        upstream,
        direct,
    })
}

/// Top-ranked entities of one class in a snapshot, ties broken by catalog
/// declaration order.
#[must_use]
pub fn top_entities(
    catalog: &EntityCatalog,
    snapshot: &GenerationSnapshot,
    class: EntityClass,
    count: usize,
) -> Vec<(String, f64)> {
    let scores = snapshot.class_scores(class);
    let mut ranked: Vec<(String, f64)> = catalog
        .keys(class)
        .map(|key| (key.to_string(), scores.get(key).copied().unwrap_or(0.0)))
        .collect();
    ranked.sort_by(|lhs, rhs| rhs.1.partial_cmp(&lhs.1).unwrap_or(Ordering::Equal));
    ranked.truncate(count);
    ranked
}

/// One observed vote for a relationship strength, from an independent source.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Observation {
    pub edge: EdgeKind,
    pub from_key: String,
    pub to_key: String,
    pub strength: Strength,
    pub observer: String,
    pub evidence: String,
}

/// Consensus strength for one matrix cell after majority voting.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConsensusCell {
    pub edge: EdgeKind,
    pub from_key: String,
    pub to_key: String,
    pub strength: Strength,
    pub votes: usize,
    pub conflicted: bool,
}

/// Observation that could not be attributed to a configured relationship.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SkippedObservation {
    pub edge: EdgeKind,
    pub from_key: String,
    pub to_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusOutcome {
    pub cells: Vec<ConsensusCell>,
    pub skipped: Vec<SkippedObservation>,
}

/// Resolve independent strength votes into one consensus strength per cell.
///
/// Majority vote decides; when two strengths are voted equally often, the
/// higher strength wins. Observations naming keys outside the catalog are
/// skipped and reported rather than failing the whole aggregation.
#[must_use]
pub fn resolve_consensus(catalog: &EntityCatalog, observations: &[Observation]) -> ConsensusOutcome {
    let mut grouped: BTreeMap<(EdgeKind, String, String), Vec<Strength>> = BTreeMap::new();
    let mut skipped = Vec::new();

    for observation in observations {
        let row_class = observation.edge.row_class();
        let col_class = observation.edge.column_class();
        if !catalog.contains(row_class, &observation.from_key) {
            skipped.push(SkippedObservation {
                edge: observation.edge,
                from_key: observation.from_key.clone(),
                to_key: observation.to_key.clone(),
                reason: format!("unknown {row_class} key: {}", observation.from_key),
            });
            continue;
        }
        if !catalog.contains(col_class, &observation.to_key) {
            skipped.push(SkippedObservation {
                edge: observation.edge,
                from_key: observation.from_key.clone(),
                to_key: observation.to_key.clone(),
                reason: format!("unknown {col_class} key: {}", observation.to_key),
            });
            continue;
        }

        grouped
            .entry((observation.edge, observation.from_key.clone(), observation.to_key.clone()))
            .or_default()
            .push(observation.strength);
    }

    let cells = grouped
        .into_iter()
        .map(|((edge, from_key, to_key), votes)| {
            let mut tally: BTreeMap<u32, usize> = BTreeMap::new();
            for vote in &votes {
                *tally.entry(vote.weight()).or_insert(0) += 1;
            }
            // Iterating the tally in ascending weight order and taking >=
            // makes equal vote counts resolve to the higher strength.
            let mut winner = (0_u32, 0_usize);
            for (weight, count) in &tally {
                if *count >= winner.1 {
                    winner = (*weight, *count);
                }
            }
            let conflicted = tally.len() > 1;
            ConsensusCell {
                edge,
                from_key,
                to_key,
                strength: Strength::from_raw(winner.0).unwrap_or(Strength::None),
                votes: votes.len(),
                conflicted,
            }
        })
        .collect();

    ConsensusOutcome { cells, skipped }
}

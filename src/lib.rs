use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};

use bit_set::BitSet;
use instant::{Duration, Instant};
use log::{debug, info, trace};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use smallvec::SmallVec;
use thiserror::Error;

/// The expected maximum length for a single placed word.
pub const MAX_WORD_LENGTH: usize = 32;

/// How many times a random candidate pick may be re-rolled after landing on
/// an already-used word before the placement attempt is abandoned.
const PICK_RETRY_LIMIT: usize = 100;

/// Length of the auto-generated seed serial used when no seed is supplied.
const AUTO_SEED_LENGTH: usize = 16;

/// An identifier for a given word, based on its index in the compiled
/// dictionary's `words` field.
pub type WordId = usize;

/// An identifier for a given phrase, based on its index in the compiled
/// dictionary's `phrases` field.
pub type PhraseId = usize;

/// Zero-indexed x and y coords for a cell in the grid, where y = 0 in the top row.
type GridCoord = (usize, usize);

/// Direction that a placed word is facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Horizontal,
    Vertical,
}

impl Orientation {
    /// Single-character tag used when hashing placement lists.
    fn tag(&self) -> char {
        match self {
            Orientation::Horizontal => 'h',
            Orientation::Vertical => 'v',
        }
    }
}

/// Map an accented letter to its unaccented form. Letters outside the
/// accented set map to themselves. Grid cells and the letter index only ever
/// hold normalized letters, so constraints derived from cells always line up
/// with index lookups.
pub fn normalize_letter(letter: char) -> char {
    match letter {
        'á' | 'à' | 'â' | 'ä' | 'ã' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        'ý' => 'y',
        'Á' | 'À' | 'Â' | 'Ä' | 'Ã' => 'A',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' => 'O',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'Ñ' => 'N',
        'Ç' => 'C',
        'Ý' => 'Y',
        other => other,
    }
}

/// Does this word consist entirely of alphanumeric or accented characters?
/// Only words passing this check are reachable through the length buckets and
/// the letter index.
fn is_indexable_word(word: &str) -> bool {
    !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || normalize_letter(c) != c)
}

/// Related entries for a single word: other words and phrases that appeared in
/// the same source dictionary entry. Used to pick a displayed clue among a
/// word's synonyms and descriptions.
#[derive(Debug, Clone, Default)]
pub struct CrossRef {
    pub words: BitSet,
    pub phrases: BitSet,
}

/// Searchable indices over a word/phrase corpus. Immutable once built.
#[derive(Clone, Default)]
pub struct CompiledDictionary {
    /// Distinct single-token headwords; index = `WordId`.
    pub words: Vec<String>,
    /// Distinct clue strings and multi-token headwords; index = `PhraseId`.
    pub phrases: Vec<String>,
    /// Word ids grouped by exact character length; index = length.
    pub length_buckets: Vec<BitSet>,
    /// Word ids keyed by (character position, normalized character).
    pub letter_index: HashMap<(usize, char), BitSet>,
    /// Per-word cross-references, parallel to `words`.
    pub cross_refs: Vec<CrossRef>,
}

impl Debug for CompiledDictionary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledDictionary")
            .field("words", &self.words.len())
            .field("phrases", &self.phrases.len())
            .field("length_buckets", &self.length_buckets.len())
            .field("letter_index", &self.letter_index.len())
            .finish()
    }
}

impl CompiledDictionary {
    /// The longest indexed word length, or 0 if nothing was indexed.
    pub fn max_word_length(&self) -> usize {
        self.length_buckets.len().saturating_sub(1)
    }

    fn bucket(&self, length: usize) -> Option<&BitSet> {
        self.length_buckets.get(length)
    }

    /// Look up the id of a word by its exact string.
    pub fn word_id(&self, word: &str) -> Option<WordId> {
        self.words.iter().position(|known| known == word)
    }
}

/// Invoke the progress callback whenever the percentage has moved past the
/// last reported boundary.
fn report_progress(
    on_progress: &mut Option<&mut dyn FnMut(u8)>,
    last_percent: &mut i32,
    percent: u8,
) {
    if let Some(callback) = on_progress.as_mut() {
        if i32::from(percent) > *last_percent {
            *last_percent = i32::from(percent);
            callback(percent);
        }
    }
}

/// Build searchable indices from raw dictionaries. Each dictionary is a
/// sequence of entries; each entry is an ordered sequence of strings where the
/// first element is the headword and the remainder are synonyms/descriptions
/// used as clue material.
///
/// Single-token headwords of at least two characters become placeable words;
/// multi-token headwords are kept as phrases only. A tail string that exactly
/// matches another headword is cross-referenced word-to-word, anything else
/// lands in `phrases`. Empty input produces empty indices rather than an
/// error.
///
/// `on_progress` is invoked at each percentage boundary from 0 to 100. This is
/// a cooperative progress-reporting contract for long compilations, not a
/// concurrency mechanism.
pub fn compile(
    dictionaries: &[Vec<Vec<String>>],
    mut on_progress: Option<&mut dyn FnMut(u8)>,
) -> CompiledDictionary {
    let mut compiled = CompiledDictionary::default();
    let mut word_ids_by_string: HashMap<String, WordId> = HashMap::new();
    let mut phrase_ids_by_string: HashMap<String, PhraseId> = HashMap::new();

    let total_entries: usize = dictionaries.iter().map(|entries| entries.len()).sum();
    let mut last_percent: i32 = -1;

    // First pass: register every headword so that tail strings can be
    // resolved against the complete word list regardless of entry order.
    let mut processed = 0usize;
    for dictionary in dictionaries {
        for entry in dictionary {
            if let Some(head) = entry.first() {
                let token_count = head.split_whitespace().count();
                if token_count == 1 && head.chars().count() >= 2 {
                    word_ids_by_string.entry(head.clone()).or_insert_with(|| {
                        compiled.words.push(head.clone());
                        compiled.cross_refs.push(CrossRef::default());
                        compiled.words.len() - 1
                    });
                } else if token_count > 1 {
                    phrase_ids_by_string.entry(head.clone()).or_insert_with(|| {
                        compiled.phrases.push(head.clone());
                        compiled.phrases.len() - 1
                    });
                }
            }

            processed += 1;
            if total_entries > 0 {
                let percent = (processed * 25 / total_entries) as u8;
                report_progress(&mut on_progress, &mut last_percent, percent);
            }
        }
    }

    // Second pass: attach each entry's tail strings to its headword, either
    // as word-to-word references (the tail is itself a headword) or as clue
    // phrases.
    let mut processed = 0usize;
    for dictionary in dictionaries {
        for entry in dictionary {
            let head_id = entry
                .first()
                .and_then(|head| word_ids_by_string.get(head).copied());

            if let Some(word_id) = head_id {
                for tail in entry.iter().skip(1) {
                    if tail.chars().count() < 2 {
                        continue;
                    }

                    if let Some(&other_id) = word_ids_by_string.get(tail) {
                        if other_id != word_id {
                            compiled.cross_refs[word_id].words.insert(other_id);
                            compiled.cross_refs[other_id].words.insert(word_id);
                        }
                    } else {
                        let phrase_id =
                            *phrase_ids_by_string.entry(tail.clone()).or_insert_with(|| {
                                compiled.phrases.push(tail.clone());
                                compiled.phrases.len() - 1
                            });
                        compiled.cross_refs[word_id].phrases.insert(phrase_id);
                    }
                }
            }

            processed += 1;
            if total_entries > 0 {
                let percent = 25 + (processed * 25 / total_entries) as u8;
                report_progress(&mut on_progress, &mut last_percent, percent);
            }
        }
    }

    // Indexing pass: accepted words populate the length buckets and the
    // letter index keyed on normalized characters.
    let word_count = compiled.words.len();
    for (word_id, word) in compiled.words.iter().enumerate() {
        if is_indexable_word(word) {
            let length = word.chars().count();

            if length >= compiled.length_buckets.len() {
                compiled.length_buckets.resize_with(length + 1, BitSet::new);
            }
            compiled.length_buckets[length].insert(word_id);

            for (position, letter) in word.chars().enumerate() {
                compiled
                    .letter_index
                    .entry((position, normalize_letter(letter)))
                    .or_insert_with(BitSet::new)
                    .insert(word_id);
            }
        }

        let percent = 50 + ((word_id + 1) * 50 / word_count) as u8;
        report_progress(&mut on_progress, &mut last_percent, percent);
    }

    report_progress(&mut on_progress, &mut last_percent, 100);

    info!(
        "compiled {} words and {} phrases into {} length buckets",
        compiled.words.len(),
        compiled.phrases.len(),
        compiled.length_buckets.len()
    );

    compiled
}

/// A single cell of a candidate grid. Every coordinate owns an independent
/// value; cells are never shared between coordinates or between grids.
#[derive(Debug, Clone, Default)]
pub struct Cell {
    pub letter: Option<char>,
    pub part_of_vertical: bool,
    pub part_of_horizontal: bool,
}

impl Cell {
    fn is_empty(&self) -> bool {
        self.letter.is_none()
    }

    fn has_flag(&self, orientation: Orientation) -> bool {
        match orientation {
            Orientation::Horizontal => self.part_of_horizontal,
            Orientation::Vertical => self.part_of_vertical,
        }
    }
}

/// A word committed to a grid at a fixed position and orientation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub word_id: WordId,
    pub word: String,
    pub orientation: Orientation,
    pub x: usize,
    pub y: usize,
}

impl Placement {
    fn len(&self) -> usize {
        self.word.chars().count()
    }

    /// Does this placement occupy the given cell?
    fn covers(&self, x: usize, y: usize) -> bool {
        match self.orientation {
            Orientation::Horizontal => y == self.y && x >= self.x && x < self.x + self.len(),
            Orientation::Vertical => x == self.x && y >= self.y && y < self.y + self.len(),
        }
    }

    /// Do this placement and another properly cross, sharing a cell in
    /// perpendicular orientations?
    fn crosses(&self, other: &Placement) -> bool {
        if self.orientation == other.orientation {
            return false;
        }

        let (horizontal, vertical) = match self.orientation {
            Orientation::Horizontal => (self, other),
            Orientation::Vertical => (other, self),
        };

        vertical.x >= horizontal.x
            && vertical.x < horizontal.x + horizontal.len()
            && horizontal.y >= vertical.y
            && horizontal.y < vertical.y + vertical.len()
    }
}

/// Coord of the `cell_idx`-th cell of a word starting at (x, y).
fn span_coord(x: usize, y: usize, orientation: Orientation, cell_idx: usize) -> GridCoord {
    match orientation {
        Orientation::Horizontal => (x + cell_idx, y),
        Orientation::Vertical => (x, y + cell_idx),
    }
}

/// A mutable candidate grid, the unit of search. Cloning produces a fully
/// independent deep copy; candidates never share state.
#[derive(Clone)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
    cells: Vec<Cell>,
    pub placements: Vec<Placement>,
    used_word_ids: BitSet,

    // Transient search state.
    finished: bool,
    border_phase: bool,
    failed_attempts: u32,

    // Annotations computed at selection time.
    pub crossing_count: usize,
    pub isolated_count: usize,
    pub fill_count: usize,
    pub score: f64,
    pub hash: u64,
}

impl Debug for Grid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grid")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("placements", &self.placements.len())
            .field("fill_count", &self.fill_count)
            .field("score", &self.score)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Grid {
    pub fn new(width: usize, height: usize) -> Grid {
        Grid {
            width,
            height,
            cells: (0..width * height).map(|_| Cell::default()).collect(),
            placements: vec![],
            used_word_ids: BitSet::new(),
            finished: false,
            border_phase: false,
            failed_attempts: 0,
            crossing_count: 0,
            isolated_count: 0,
            fill_count: 0,
            score: 0.0,
            hash: 0,
        }
    }

    pub fn cell(&self, x: usize, y: usize) -> &Cell {
        &self.cells[y * self.width + x]
    }

    fn cell_mut(&mut self, x: usize, y: usize) -> &mut Cell {
        &mut self.cells[y * self.width + x]
    }

    /// No further placement will be attempted on this grid this generation.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Has the search switched to forcing border coverage?
    pub fn in_border_phase(&self) -> bool {
        self.border_phase
    }

    fn placements_at(&self, x: usize, y: usize) -> impl Iterator<Item = &Placement> {
        self.placements
            .iter()
            .filter(move |placement| placement.covers(x, y))
    }

    fn count_filled(&self) -> usize {
        self.cells.iter().filter(|cell| cell.letter.is_some()).count()
    }

    /// Fraction of perimeter cells currently holding a letter.
    fn perimeter_coverage(&self) -> f64 {
        if self.width < 2 || self.height < 2 {
            return 0.0;
        }

        let perimeter_cells = 2 * (self.width + self.height) - 4;
        let mut covered = 0usize;

        for x in 0..self.width {
            if !self.cell(x, 0).is_empty() {
                covered += 1;
            }
            if !self.cell(x, self.height - 1).is_empty() {
                covered += 1;
            }
        }
        for y in 1..self.height - 1 {
            if !self.cell(0, y).is_empty() {
                covered += 1;
            }
            if !self.cell(self.width - 1, y).is_empty() {
                covered += 1;
            }
        }

        covered as f64 / perimeter_cells as f64
    }
}

/// Scoring callback: (fill, crossings, isolated) -> score.
pub type ScoreFunction = fn(usize, usize, usize) -> f64;

/// Default grid score: rewards density and crossings, heavily penalizes
/// isolated words.
pub fn default_score_function(fill: usize, crossings: usize, isolated: usize) -> f64 {
    (fill * 4 + 2 * crossings) as f64 / (1 + isolated * 4) as f64
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("generator options must include a compiled dictionary")]
    MissingCompilation,
}

/// Tuning knobs for a generator instance.
pub struct GeneratorOptions {
    /// The compiled dictionary to draw words from. Required.
    pub compilation: Option<CompiledDictionary>,
    /// Grid width in cells.
    pub width: usize,
    /// Grid height in cells.
    pub height: usize,
    /// Marker rendered for empty cells.
    pub empty_space: char,
    /// How many placement attempts each candidate receives per generation.
    pub words_per_iteration: usize,
    /// How many candidate clones each generation produces.
    pub solutions_per_iteration: usize,
    /// How many scored candidates survive selection.
    pub selected_solutions: usize,
    /// Target border-coverage fraction (0..1); 0 disables border forcing.
    pub words_on_border: f64,
    /// How quickly the minimum word length shrinks as placements accumulate.
    pub minimum_length_factor: f64,
    /// Consecutive failed attempts tolerated before a grid escalates to the
    /// border phase or finishes.
    pub finish_at: u32,
    /// Replacement for the default score function.
    pub score_function: Option<ScoreFunction>,
    /// Words excluded from every grid, resolved against the compilation.
    pub ignored_words: Vec<String>,
}

impl Default for GeneratorOptions {
    fn default() -> GeneratorOptions {
        GeneratorOptions {
            compilation: None,
            width: 20,
            height: 20,
            empty_space: ' ',
            words_per_iteration: 10,
            solutions_per_iteration: 10,
            selected_solutions: 5,
            words_on_border: 0.5,
            minimum_length_factor: 0.1,
            finish_at: 100,
            score_function: None,
            ignored_words: vec![],
        }
    }
}

/// Counters tracking the search effort across generations.
#[derive(Debug, Clone, Default)]
pub struct SearchStatistics {
    pub attempts: u64,
    pub placed: u64,
    pub rejected: u64,
    pub border_escalations: u64,
    pub finished_grids: u64,
    pub duration: Duration,
}

/// Fold a seed string into a 64-bit value (FNV-1a).
fn fold_seed(seed: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in seed.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// An alphanumeric serial for runs that did not supply a seed.
fn random_serial() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTO_SEED_LENGTH)
        .map(char::from)
        .collect()
}

/// The crossword generator. Owns its options, the compiled dictionary, the
/// ignored-word set, the seeded random source and the search statistics; all
/// component passes borrow state from here.
pub struct Generator {
    options: GeneratorOptions,
    compilation: CompiledDictionary,
    ignored_word_ids: BitSet,
    rng: StdRng,
    statistics: SearchStatistics,
}

impl Generator {
    /// Build a generator from options. Fails if the options carry no compiled
    /// dictionary.
    pub fn new(mut options: GeneratorOptions) -> Result<Generator, ConfigError> {
        let compilation = options
            .compilation
            .take()
            .ok_or(ConfigError::MissingCompilation)?;

        let mut ignored_word_ids = BitSet::new();
        for word in &options.ignored_words {
            if let Some(word_id) = compilation.word_id(word) {
                ignored_word_ids.insert(word_id);
            }
        }

        Ok(Generator {
            options,
            compilation,
            ignored_word_ids,
            rng: StdRng::seed_from_u64(0),
            statistics: SearchStatistics::default(),
        })
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    pub fn compilation(&self) -> &CompiledDictionary {
        &self.compilation
    }

    pub fn statistics(&self) -> &SearchStatistics {
        &self.statistics
    }

    /// Create an empty grid and reseed the random source. Runs with the same
    /// seed, dictionary and options reproduce bit-for-bit.
    pub fn generate(&mut self, seed: Option<&str>) -> Grid {
        let seed = match seed {
            Some(seed) => seed.to_string(),
            None => random_serial(),
        };

        info!("seeding run with {:?}", seed);
        self.rng = StdRng::seed_from_u64(fold_seed(&seed));

        Grid::new(self.options.width, self.options.height)
    }

    /// Advance the population by one generation: clone survivors
    /// proportionally into `solutions_per_iteration` candidates, mutate each
    /// clone with repeated placement attempts, then score and select. The
    /// input grids are never modified.
    pub fn iterate(&mut self, population: &[Grid]) -> Vec<Grid> {
        if population.is_empty() {
            return vec![];
        }

        let start = Instant::now();
        let candidate_count = self.options.solutions_per_iteration;
        let mut batch: Vec<Grid> = Vec::with_capacity(candidate_count);

        for candidate_idx in 0..candidate_count {
            // Cycle through the survivors so each seeds an even share of the
            // new generation.
            let source_idx = population.len() * candidate_idx / candidate_count;
            let mut candidate = population[source_idx].clone();

            for _ in 0..self.options.words_per_iteration {
                self.try_place_word(&mut candidate);
            }

            batch.push(candidate);
        }

        let survivors = self.select(batch, self.options.selected_solutions);
        self.statistics.duration += start.elapsed();
        survivors
    }

    /// Score, deduplicate, rank and truncate a batch of candidate grids.
    pub fn select(&self, grids: Vec<Grid>, count: usize) -> Vec<Grid> {
        let score_function = self.options.score_function.unwrap_or(default_score_function);

        let mut selected = grids;
        for grid in &mut selected {
            annotate_grid(grid, score_function);
        }

        // Identical placement lists collapse to their first occurrence.
        let mut seen_hashes: HashSet<u64> = HashSet::with_capacity(selected.len());
        selected.retain(|grid| seen_hashes.insert(grid.hash));

        // Stable sort: ties keep their input order.
        selected.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        selected.truncate(count);

        if let Some(best) = selected.first() {
            debug!("selected {} grids, best score {:.2}", selected.len(), best.score);
        }

        selected
    }

    /// Try to add one word to the grid. Any rejection counts against the
    /// grid's retry budget; exhausting the budget escalates to the border
    /// phase or finishes the grid.
    fn try_place_word(&mut self, grid: &mut Grid) {
        if grid.finished {
            return;
        }
        self.statistics.attempts += 1;

        let orientation = if self.rng.gen_bool(0.5) {
            Orientation::Vertical
        } else {
            Orientation::Horizontal
        };
        let span = match orientation {
            Orientation::Horizontal => grid.width,
            Orientation::Vertical => grid.height,
        };

        let target_length = self.pick_target_length(grid, span);
        if target_length > span {
            self.record_failure(grid);
            return;
        }

        let (x, y) = self.pick_position(grid, orientation, target_length);

        if end_cap_blocked(grid, x, y, orientation, target_length) {
            self.record_failure(grid);
            return;
        }

        let constraints = match collect_constraints(grid, x, y, orientation, target_length) {
            Some(constraints) => constraints,
            None => {
                self.record_failure(grid);
                return;
            }
        };

        // Isolated words are disallowed while border coverage is being
        // forced.
        if constraints.is_empty() && grid.border_phase {
            self.record_failure(grid);
            return;
        }

        let candidates = self.filter_candidates(grid, target_length, &constraints);
        if candidates.is_empty() {
            self.record_failure(grid);
            return;
        }

        if !self.commit_candidate(grid, &candidates, x, y, orientation) {
            self.record_failure(grid);
            return;
        }

        self.statistics.placed += 1;
        grid.failed_attempts = 0;

        // Once enough of the perimeter is covered, switch the grid over to
        // forcing border placements.
        if !grid.border_phase
            && self.options.words_on_border > 0.0
            && grid.perimeter_coverage() > self.options.words_on_border
        {
            debug!("perimeter coverage reached, entering border phase");
            grid.border_phase = true;
        }
    }

    /// Target length for the next placement: the larger of a shrinking floor
    /// (starts near the grid size, relaxes as placements accumulate, never
    /// below 2) and a uniformly random length up to the usable span.
    fn pick_target_length(&mut self, grid: &Grid, span: usize) -> usize {
        let max_bucket = self.compilation.max_word_length() as f64;
        let base = (grid.width as f64)
            .min(grid.height as f64)
            .min(max_bucket / 3.0 - 1.0);
        let shrink = (grid.placements.len() as f64 * self.options.minimum_length_factor).floor();
        let floor = (base - shrink).max(2.0);

        let random_length = self.rng.gen_range(0..=span) as f64;
        floor.max(random_length) as usize
    }

    /// Pick a start position. Outside the border phase the position is
    /// unconstrained; once border forcing is active one coordinate is pinned
    /// to a grid edge.
    fn pick_position(&mut self, grid: &Grid, orientation: Orientation, length: usize) -> GridCoord {
        match orientation {
            Orientation::Horizontal => {
                let x = self.rng.gen_range(0..=grid.width - length);
                let y = if grid.border_phase {
                    if self.rng.gen_bool(0.5) {
                        0
                    } else {
                        grid.height - 1
                    }
                } else {
                    self.rng.gen_range(0..grid.height)
                };
                (x, y)
            }
            Orientation::Vertical => {
                let y = self.rng.gen_range(0..=grid.height - length);
                let x = if grid.border_phase {
                    if self.rng.gen_bool(0.5) {
                        0
                    } else {
                        grid.width - 1
                    }
                } else {
                    self.rng.gen_range(0..grid.width)
                };
                (x, y)
            }
        }
    }

    /// Candidate word ids for a span: the length bucket minus ignored and
    /// already-used words, narrowed through the letter index by every
    /// crossing constraint.
    fn filter_candidates(
        &self,
        grid: &Grid,
        length: usize,
        constraints: &[(usize, char)],
    ) -> BitSet {
        let mut candidates = match self.compilation.bucket(length) {
            Some(bucket) => bucket.clone(),
            None => return BitSet::new(),
        };

        candidates.difference_with(&self.ignored_word_ids);
        candidates.difference_with(&grid.used_word_ids);

        for &(position, letter) in constraints {
            if candidates.is_empty() {
                break;
            }
            match self
                .compilation
                .letter_index
                .get(&(position, normalize_letter(letter)))
            {
                Some(ids) => candidates.intersect_with(ids),
                None => return BitSet::new(),
            }
        }

        candidates
    }

    /// Write a randomly chosen candidate into the grid. The pick is re-rolled
    /// up to `PICK_RETRY_LIMIT` times if it lands on an already-used id;
    /// running out of re-rolls abandons the attempt.
    fn commit_candidate(
        &mut self,
        grid: &mut Grid,
        candidates: &BitSet,
        x: usize,
        y: usize,
        orientation: Orientation,
    ) -> bool {
        let ids: Vec<WordId> = candidates.iter().collect();
        if ids.is_empty() {
            return false;
        }

        let mut pick = ids[self.rng.gen_range(0..ids.len())];
        let mut rerolls = 0;
        while grid.used_word_ids.contains(pick) {
            if rerolls == PICK_RETRY_LIMIT {
                return false;
            }
            pick = ids[self.rng.gen_range(0..ids.len())];
            rerolls += 1;
        }

        let word = self.compilation.words[pick].clone();
        for (cell_idx, letter) in word.chars().enumerate() {
            let (cell_x, cell_y) = span_coord(x, y, orientation, cell_idx);
            let cell = grid.cell_mut(cell_x, cell_y);
            cell.letter = Some(normalize_letter(letter));
            match orientation {
                Orientation::Horizontal => cell.part_of_horizontal = true,
                Orientation::Vertical => cell.part_of_vertical = true,
            }
        }

        grid.used_word_ids.insert(pick);
        trace!("placed {:?} {:?} at ({}, {})", word, orientation, x, y);
        grid.placements.push(Placement {
            word_id: pick,
            word,
            orientation,
            x,
            y,
        });

        true
    }

    /// Count a failed attempt. Exhausting the retry budget escalates to the
    /// border phase when border forcing is enabled and not yet active, and
    /// finishes the grid otherwise.
    fn record_failure(&mut self, grid: &mut Grid) {
        self.statistics.rejected += 1;
        grid.failed_attempts += 1;

        if grid.failed_attempts >= self.options.finish_at {
            if !grid.border_phase && self.options.words_on_border > 0.0 {
                grid.border_phase = true;
                grid.failed_attempts = 0;
                self.statistics.border_escalations += 1;
                debug!("retry budget exhausted, entering border phase");
            } else {
                grid.finished = true;
                self.statistics.finished_grids += 1;
                trace!("retry budget exhausted, grid finished");
            }
        }
    }
}

/// Would the cell just before or just after the span carry a word of the same
/// orientation? Two parallel words may never touch end-to-end without a gap.
fn end_cap_blocked(
    grid: &Grid,
    x: usize,
    y: usize,
    orientation: Orientation,
    length: usize,
) -> bool {
    match orientation {
        Orientation::Horizontal => {
            if x > 0 && grid.cell(x - 1, y).part_of_horizontal {
                return true;
            }
            if x + length < grid.width && grid.cell(x + length, y).part_of_horizontal {
                return true;
            }
        }
        Orientation::Vertical => {
            if y > 0 && grid.cell(x, y - 1).part_of_vertical {
                return true;
            }
            if y + length < grid.height && grid.cell(x, y + length).part_of_vertical {
                return true;
            }
        }
    }
    false
}

/// Walk the span a word would occupy, rejecting structural conflicts and
/// collecting the letter constraints imposed by existing crossings. Returns
/// None if the span overlaps a same-orientation word or runs directly beside
/// a placement it does not cross.
fn collect_constraints(
    grid: &Grid,
    x: usize,
    y: usize,
    orientation: Orientation,
    length: usize,
) -> Option<SmallVec<[(usize, char); MAX_WORD_LENGTH]>> {
    let mut constraints: SmallVec<[(usize, char); MAX_WORD_LENGTH]> = SmallVec::new();

    for cell_idx in 0..length {
        let (cell_x, cell_y) = span_coord(x, y, orientation, cell_idx);
        let cell = grid.cell(cell_x, cell_y);

        // Two parallel words can never share a cell.
        if cell.has_flag(orientation) {
            return None;
        }

        // Orthogonal neighbors must belong to placements that properly cross
        // this exact cell; anything else is a word running alongside without
        // intersecting.
        for (neighbor_x, neighbor_y) in orthogonal_neighbors(grid, cell_x, cell_y, orientation) {
            if grid.cell(neighbor_x, neighbor_y).is_empty() {
                continue;
            }
            if !grid
                .placements_at(neighbor_x, neighbor_y)
                .all(|placement| placement.covers(cell_x, cell_y))
            {
                return None;
            }
        }

        if let Some(letter) = cell.letter {
            constraints.push((cell_idx, letter));
        }
    }

    Some(constraints)
}

/// The up-to-two in-bounds cells orthogonally adjacent to (x, y) relative to
/// a word of the given orientation.
fn orthogonal_neighbors(
    grid: &Grid,
    x: usize,
    y: usize,
    orientation: Orientation,
) -> SmallVec<[GridCoord; 2]> {
    let mut neighbors: SmallVec<[GridCoord; 2]> = SmallVec::new();

    match orientation {
        Orientation::Horizontal => {
            if y > 0 {
                neighbors.push((x, y - 1));
            }
            if y + 1 < grid.height {
                neighbors.push((x, y + 1));
            }
        }
        Orientation::Vertical => {
            if x > 0 {
                neighbors.push((x - 1, y));
            }
            if x + 1 < grid.width {
                neighbors.push((x + 1, y));
            }
        }
    }

    neighbors
}

/// Fill in a grid's selection annotations: crossing and isolation counts from
/// a pairwise scan of the placement list, the fill count, the dedup hash and
/// the resulting score.
fn annotate_grid(grid: &mut Grid, score_function: ScoreFunction) {
    let placements = &grid.placements;
    let mut crossings_by_placement = vec![0usize; placements.len()];
    let mut crossing_count = 0usize;

    for first_idx in 0..placements.len() {
        for second_idx in first_idx + 1..placements.len() {
            if placements[first_idx].crosses(&placements[second_idx]) {
                crossing_count += 1;
                crossings_by_placement[first_idx] += 1;
                crossings_by_placement[second_idx] += 1;
            }
        }
    }

    grid.crossing_count = crossing_count;
    grid.isolated_count = crossings_by_placement
        .iter()
        .filter(|&&count| count == 0)
        .count();
    grid.fill_count = grid.count_filled();
    grid.hash = placement_hash(&grid.placements);
    grid.score = score_function(grid.fill_count, grid.crossing_count, grid.isolated_count);
}

/// Rolling hash over the ordered placement list, used only for exact
/// duplicate detection within a generation.
fn placement_hash(placements: &[Placement]) -> u64 {
    let mut hash: u64 = 5381;

    for placement in placements {
        let token = format!(
            "{}{}{}{}",
            placement.word,
            placement.orientation.tag(),
            placement.x,
            placement.y
        );
        for byte in token.bytes() {
            hash = hash.wrapping_mul(33).wrapping_add(u64::from(byte));
        }
    }

    hash
}

/// The expected maximum number of fillable runs discovered in one scan.
const MAX_RUN_COUNT: usize = 32;

/// A maximal stretch of cells that could take a new word during the
/// completion pass. Endpoints may sit on existing letters, which become
/// crossing constraints.
#[derive(Debug, Clone, Copy)]
struct EmptyRun {
    x: usize,
    y: usize,
    length: usize,
    orientation: Orientation,
}

type RunList = SmallVec<[EmptyRun; MAX_RUN_COUNT]>;

/// Find every horizontal run worth filling. A run extends through empty
/// cells; a letter held only by a vertical word is included as a crossing
/// endpoint, while a horizontal word (or a crossing letter sitting right next
/// to one) stops the extension two cells short to keep a gap. Runs must be at
/// least two cells long, touch a letter at one end, and must not lay empty
/// cells directly alongside filled ones.
fn scan_horizontal_runs(grid: &Grid, runs: &mut RunList) {
    for y in 0..grid.height {
        let mut x = 0;
        while x < grid.width {
            if !grid.cell(x, y).is_empty() {
                x += 1;
                continue;
            }

            // Maximal empty segment starting here.
            let seg_start = x;
            let mut seg_end = x;
            while seg_end + 1 < grid.width && grid.cell(seg_end + 1, y).is_empty() {
                seg_end += 1;
            }
            x = seg_end + 1;

            let mut start = seg_start as isize;
            if seg_start > 0 {
                if grid.cell(seg_start - 1, y).part_of_horizontal {
                    start = seg_start as isize + 1;
                } else if seg_start >= 2 && grid.cell(seg_start - 2, y).part_of_horizontal {
                    start = seg_start as isize;
                } else {
                    start = seg_start as isize - 1;
                }
            }

            let mut end = seg_end as isize;
            if seg_end + 1 < grid.width {
                if grid.cell(seg_end + 1, y).part_of_horizontal {
                    end = seg_end as isize - 1;
                } else if seg_end + 2 < grid.width && grid.cell(seg_end + 2, y).part_of_horizontal {
                    end = seg_end as isize;
                } else {
                    end = seg_end as isize + 1;
                }
            }

            if end - start + 1 < 2 {
                continue;
            }
            let (start, end) = (start as usize, end as usize);

            // A run is only worth recording if it can cross something.
            if grid.cell(start, y).is_empty() && grid.cell(end, y).is_empty() {
                continue;
            }

            let mut flanked = false;
            for run_x in start..=end {
                if !grid.cell(run_x, y).is_empty() {
                    continue;
                }
                if y > 0 && !grid.cell(run_x, y - 1).is_empty() {
                    flanked = true;
                    break;
                }
                if y + 1 < grid.height && !grid.cell(run_x, y + 1).is_empty() {
                    flanked = true;
                    break;
                }
            }
            if flanked {
                continue;
            }

            runs.push(EmptyRun {
                x: start,
                y,
                length: end - start + 1,
                orientation: Orientation::Horizontal,
            });
        }
    }
}

/// Mirror of `scan_horizontal_runs` for vertical runs.
fn scan_vertical_runs(grid: &Grid, runs: &mut RunList) {
    for x in 0..grid.width {
        let mut y = 0;
        while y < grid.height {
            if !grid.cell(x, y).is_empty() {
                y += 1;
                continue;
            }

            let seg_start = y;
            let mut seg_end = y;
            while seg_end + 1 < grid.height && grid.cell(x, seg_end + 1).is_empty() {
                seg_end += 1;
            }
            y = seg_end + 1;

            let mut start = seg_start as isize;
            if seg_start > 0 {
                if grid.cell(x, seg_start - 1).part_of_vertical {
                    start = seg_start as isize + 1;
                } else if seg_start >= 2 && grid.cell(x, seg_start - 2).part_of_vertical {
                    start = seg_start as isize;
                } else {
                    start = seg_start as isize - 1;
                }
            }

            let mut end = seg_end as isize;
            if seg_end + 1 < grid.height {
                if grid.cell(x, seg_end + 1).part_of_vertical {
                    end = seg_end as isize - 1;
                } else if seg_end + 2 < grid.height && grid.cell(x, seg_end + 2).part_of_vertical {
                    end = seg_end as isize;
                } else {
                    end = seg_end as isize + 1;
                }
            }

            if end - start + 1 < 2 {
                continue;
            }
            let (start, end) = (start as usize, end as usize);

            if grid.cell(x, start).is_empty() && grid.cell(x, end).is_empty() {
                continue;
            }

            let mut flanked = false;
            for run_y in start..=end {
                if !grid.cell(x, run_y).is_empty() {
                    continue;
                }
                if x > 0 && !grid.cell(x - 1, run_y).is_empty() {
                    flanked = true;
                    break;
                }
                if x + 1 < grid.width && !grid.cell(x + 1, run_y).is_empty() {
                    flanked = true;
                    break;
                }
            }
            if flanked {
                continue;
            }

            runs.push(EmptyRun {
                x,
                y: start,
                length: end - start + 1,
                orientation: Orientation::Vertical,
            });
        }
    }
}

impl Generator {
    /// Completion pass: deterministically fill remaining empty runs with
    /// crossing words until a full scan places nothing, then re-select.
    pub fn fill_empty_spaces(&mut self, grids: &[Grid]) -> Vec<Grid> {
        let start = Instant::now();

        let mut completed: Vec<Grid> = grids.to_vec();
        for grid in &mut completed {
            self.fill_grid(grid);
        }

        let survivors = self.select(completed, self.options.selected_solutions);
        self.statistics.duration += start.elapsed();
        survivors
    }

    /// Run the completion pass on one grid to a fixed point. The grid is
    /// owned exclusively while this runs; every successful placement restarts
    /// the scan since the run geometry has changed.
    fn fill_grid(&mut self, grid: &mut Grid) {
        loop {
            let mut runs: RunList = SmallVec::new();
            scan_horizontal_runs(grid, &mut runs);
            scan_vertical_runs(grid, &mut runs);

            // Longer runs first; the sort is stable so equal lengths keep
            // scan order.
            runs.sort_by(|a, b| b.length.cmp(&a.length));

            let mut placed = false;
            for run in &runs {
                if self.try_fill_run(grid, run) {
                    placed = true;
                    break;
                }
            }

            if !placed {
                break;
            }
        }
    }

    /// Attempt to fill a single run, deriving crossing constraints from its
    /// endpoints. Same commit mechanics as the randomized placer, minus the
    /// border logic.
    fn try_fill_run(&mut self, grid: &mut Grid, run: &EmptyRun) -> bool {
        let mut constraints: SmallVec<[(usize, char); 2]> = SmallVec::new();

        if let Some(letter) = grid.cell(run.x, run.y).letter {
            constraints.push((0, letter));
        }
        let (end_x, end_y) = span_coord(run.x, run.y, run.orientation, run.length - 1);
        if let Some(letter) = grid.cell(end_x, end_y).letter {
            constraints.push((run.length - 1, letter));
        }

        let candidates = self.filter_candidates(grid, run.length, &constraints);
        if candidates.is_empty() {
            return false;
        }

        if self.commit_candidate(grid, &candidates, run.x, run.y, run.orientation) {
            self.statistics.placed += 1;
            true
        } else {
            false
        }
    }
}

/// Turn a grid into a rendered string, one row per line, empty cells shown as
/// `empty_space`.
pub fn render_grid(grid: &Grid, empty_space: char) -> String {
    let mut rows: Vec<String> = Vec::with_capacity(grid.height);

    for y in 0..grid.height {
        rows.push(
            (0..grid.width)
                .map(|x| grid.cell(x, y).letter.unwrap_or(empty_space))
                .collect(),
        );
    }

    rows.join("\n")
}

/// One exported clue: a placement plus its displayed question.
#[derive(Debug, Clone, Serialize)]
pub struct ClueRecord {
    pub x: usize,
    pub y: usize,
    pub horizontal: bool,
    pub word: String,
    pub question: String,
}

impl Generator {
    /// Project a grid's placements into clue records, picking each question
    /// uniformly at random among the word's cross-referenced synonyms,
    /// descriptions and phrases. A word with no cross-references falls back
    /// to its own string.
    pub fn project_clues(&mut self, grid: &Grid) -> Vec<ClueRecord> {
        let mut records = Vec::with_capacity(grid.placements.len());

        for placement in &grid.placements {
            let question = self.pick_clue(placement.word_id);
            records.push(ClueRecord {
                x: placement.x,
                y: placement.y,
                horizontal: placement.orientation == Orientation::Horizontal,
                word: placement.word.clone(),
                question,
            });
        }

        records
    }

    fn pick_clue(&mut self, word_id: WordId) -> String {
        let cross_ref = &self.compilation.cross_refs[word_id];

        let mut choices: Vec<&str> = cross_ref
            .words
            .iter()
            .map(|other_id| self.compilation.words[other_id].as_str())
            .collect();
        choices.extend(
            cross_ref
                .phrases
                .iter()
                .map(|phrase_id| self.compilation.phrases[phrase_id].as_str()),
        );

        if choices.is_empty() {
            return self.compilation.words[word_id].clone();
        }
        choices[self.rng.gen_range(0..choices.len())].to_string()
    }
}

/// Width of the word column in the clue listing.
const CLUE_COLUMN_WIDTH: usize = 18;

/// Pad or truncate a token to exactly `width` characters. Characters that
/// cannot be displayed degrade to a placeholder.
fn pad_token(token: &str, width: usize) -> String {
    let mut padded = String::with_capacity(width);
    let mut written = 0;

    for letter in token.chars() {
        if written == width {
            break;
        }
        padded.push(if letter.is_control() { '?' } else { letter });
        written += 1;
    }
    while written < width {
        padded.push(' ');
        written += 1;
    }

    padded
}

/// Render clue records as a fixed-width textual listing.
pub fn render_clue_listing(clues: &[ClueRecord]) -> String {
    let mut lines: Vec<String> = Vec::with_capacity(clues.len());

    for clue in clues {
        let direction = if clue.horizontal { "across" } else { "down" };
        lines.push(format!(
            "{:>3},{:<3} {} {} {}",
            clue.x,
            clue.y,
            pad_token(direction, 6),
            pad_token(&clue.word, CLUE_COLUMN_WIDTH),
            clue.question
        ));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::Orientation::{Horizontal, Vertical};
    use crate::*;

    fn entry(strings: &[&str]) -> Vec<String> {
        strings.iter().map(|s| s.to_string()).collect()
    }

    fn animal_dictionaries() -> Vec<Vec<Vec<String>>> {
        vec![vec![entry(&["CAT", "feline"]), entry(&["DOG", "canine"])]]
    }

    fn three_letter_compilation() -> CompiledDictionary {
        compile(
            &[vec![
                entry(&["CAT", "small feline pet"]),
                entry(&["DOG", "loyal companion"]),
                entry(&["SUN", "star at the center"]),
                entry(&["RAT", "rodent"]),
                entry(&["TAR", "black residue"]),
                entry(&["ART", "creative work"]),
                entry(&["CAR", "vehicle"]),
                entry(&["OAT", "cereal grain"]),
            ]],
            None,
        )
    }

    fn generator_with(
        compilation: CompiledDictionary,
        configure: impl FnOnce(&mut GeneratorOptions),
    ) -> Generator {
        let mut options = GeneratorOptions {
            compilation: Some(compilation),
            ..GeneratorOptions::default()
        };
        configure(&mut options);
        Generator::new(options).expect("fixture options were incomplete")
    }

    /// Write a word straight into a grid, bypassing the placer.
    fn place_for_test(
        grid: &mut Grid,
        compilation: &CompiledDictionary,
        word: &str,
        orientation: Orientation,
        x: usize,
        y: usize,
    ) {
        let word_id = compilation.word_id(word).expect("fixture word missing");

        for (cell_idx, letter) in word.chars().enumerate() {
            let (cell_x, cell_y) = span_coord(x, y, orientation, cell_idx);
            let index = cell_y * grid.width + cell_x;
            grid.cells[index].letter = Some(normalize_letter(letter));
            match orientation {
                Horizontal => grid.cells[index].part_of_horizontal = true,
                Vertical => grid.cells[index].part_of_vertical = true,
            }
        }

        grid.used_word_ids.insert(word_id);
        grid.placements.push(Placement {
            word_id,
            word: word.to_string(),
            orientation,
            x,
            y,
        });
    }

    /// Check the structural invariants every grid must satisfy: placements in
    /// bounds, no same-orientation overlaps, crossing cells agreeing in
    /// letter, and cells consistent with the placement list.
    fn assert_structurally_valid(grid: &Grid) {
        let mut horizontal_cover = vec![0usize; grid.width * grid.height];
        let mut vertical_cover = vec![0usize; grid.width * grid.height];
        let mut letters: Vec<Option<char>> = vec![None; grid.width * grid.height];

        for placement in &grid.placements {
            let length = placement.word.chars().count();
            match placement.orientation {
                Horizontal => {
                    assert!(placement.x + length <= grid.width, "placement out of bounds");
                    assert!(placement.y < grid.height, "placement out of bounds");
                }
                Vertical => {
                    assert!(placement.y + length <= grid.height, "placement out of bounds");
                    assert!(placement.x < grid.width, "placement out of bounds");
                }
            }

            for (cell_idx, letter) in placement.word.chars().enumerate() {
                let (x, y) = span_coord(placement.x, placement.y, placement.orientation, cell_idx);
                let index = y * grid.width + x;
                let normalized = normalize_letter(letter);

                match placement.orientation {
                    Horizontal => horizontal_cover[index] += 1,
                    Vertical => vertical_cover[index] += 1,
                }

                if let Some(existing) = letters[index] {
                    assert_eq!(existing, normalized, "crossing letters disagree at ({}, {})", x, y);
                }
                letters[index] = Some(normalized);
                assert_eq!(grid.cell(x, y).letter, Some(normalized));
            }
        }

        for index in 0..grid.width * grid.height {
            assert!(horizontal_cover[index] <= 1, "two horizontal words overlap");
            assert!(vertical_cover[index] <= 1, "two vertical words overlap");
        }
    }

    #[test]
    fn test_compile_builds_expected_indices() {
        let compiled = compile(&animal_dictionaries(), None);

        assert_eq!(compiled.words, vec!["CAT".to_string(), "DOG".to_string()]);
        assert_eq!(compiled.phrases, vec!["feline".to_string(), "canine".to_string()]);

        let bucket: Vec<WordId> = compiled.length_buckets[3].iter().collect();
        assert_eq!(bucket, vec![0, 1]);

        let starts_with_c: Vec<WordId> = compiled.letter_index[&(0, 'C')].iter().collect();
        assert_eq!(starts_with_c, vec![0]);
        let starts_with_d: Vec<WordId> = compiled.letter_index[&(0, 'D')].iter().collect();
        assert_eq!(starts_with_d, vec![1]);
    }

    #[test]
    fn test_compile_is_idempotent_and_order_insensitive() {
        let first = compile(&animal_dictionaries(), None);
        let second = compile(&animal_dictionaries(), None);

        assert_eq!(first.words, second.words);
        assert_eq!(first.length_buckets, second.length_buckets);
        assert_eq!(first.letter_index.len(), second.letter_index.len());
        for (key, ids) in &first.letter_index {
            assert_eq!(Some(ids), second.letter_index.get(key));
        }

        // Reordering the tail strings of an entry leaves the indices alone.
        let reordered = compile(
            &[vec![
                entry(&["CAT", "gato", "feline"]),
                entry(&["DOG", "canine"]),
            ]],
            None,
        );
        let baseline = compile(
            &[vec![
                entry(&["CAT", "feline", "gato"]),
                entry(&["DOG", "canine"]),
            ]],
            None,
        );
        assert_eq!(reordered.words, baseline.words);
        assert_eq!(reordered.length_buckets, baseline.length_buckets);
        for (key, ids) in &reordered.letter_index {
            assert_eq!(Some(ids), baseline.letter_index.get(key));
        }
    }

    #[test]
    fn test_compile_drops_short_and_multi_token_heads() {
        let compiled = compile(
            &[vec![entry(&["A", "article"]), entry(&["ICE CREAM", "frozen dessert"])]],
            None,
        );

        assert!(compiled.words.is_empty());
        assert_eq!(compiled.phrases, vec!["ICE CREAM".to_string()]);
        assert!(compiled.length_buckets.is_empty());
        assert!(compiled.letter_index.is_empty());
    }

    #[test]
    fn test_compile_indexes_accented_words_normalized() {
        let compiled = compile(&[vec![entry(&["café", "coffee place"])]], None);

        assert_eq!(compiled.words, vec!["café".to_string()]);
        assert!(compiled.length_buckets[4].contains(0));
        assert!(compiled.letter_index.contains_key(&(3, 'e')));
        assert!(!compiled.letter_index.contains_key(&(3, 'é')));
    }

    #[test]
    fn test_compile_progress_reaches_completion() {
        let mut reported: Vec<u8> = vec![];
        {
            let mut callback = |percent: u8| reported.push(percent);
            compile(&animal_dictionaries(), Some(&mut callback));
        }
        assert_eq!(reported.last(), Some(&100));
        assert!(reported.iter().all(|&percent| percent <= 100));
        assert!(reported.windows(2).all(|pair| pair[0] < pair[1]));

        // Empty input still completes.
        let mut reported_empty: Vec<u8> = vec![];
        {
            let mut callback = |percent: u8| reported_empty.push(percent);
            compile(&[], Some(&mut callback));
        }
        assert_eq!(reported_empty, vec![100]);
    }

    #[test]
    fn test_compile_cross_references_words_and_phrases() {
        let compiled = compile(
            &[vec![entry(&["CAT", "feline", "DOG"]), entry(&["DOG", "canine"])]],
            None,
        );

        let cat = compiled.word_id("CAT").expect("CAT missing");
        let dog = compiled.word_id("DOG").expect("DOG missing");
        assert!(compiled.cross_refs[cat].words.contains(dog));
        assert!(compiled.cross_refs[dog].words.contains(cat));

        let feline = compiled.phrases.iter().position(|p| p == "feline").unwrap();
        assert!(compiled.cross_refs[cat].phrases.contains(feline));
        let canine = compiled.phrases.iter().position(|p| p == "canine").unwrap();
        assert!(compiled.cross_refs[dog].phrases.contains(canine));
    }

    #[test]
    fn test_generator_requires_compilation() {
        let error = Generator::new(GeneratorOptions::default())
            .err()
            .expect("construction should fail without a compilation");
        assert!(matches!(error, ConfigError::MissingCompilation));
    }

    #[test]
    fn test_generate_returns_empty_grid() {
        let mut generator = generator_with(three_letter_compilation(), |options| {
            options.width = 7;
            options.height = 5;
        });

        let grid = generator.generate(Some("fixed"));

        assert_eq!(grid.width, 7);
        assert_eq!(grid.height, 5);
        assert!(grid.placements.is_empty());
        let blank: Vec<String> = (0..5).map(|_| ".".repeat(7)).collect();
        assert_eq!(render_grid(&grid, '.'), blank.join("\n"));
    }

    #[test]
    fn test_iterate_places_one_word_on_small_grid() {
        let mut generator = generator_with(three_letter_compilation(), |options| {
            options.width = 5;
            options.height = 5;
            options.words_per_iteration = 1;
            options.solutions_per_iteration = 64;
            options.selected_solutions = 1;
            options.words_on_border = 0.0;
        });

        let grid = generator.generate(Some("single-word-seed"));
        let survivors = generator.iterate(&[grid]);

        assert_eq!(survivors.len(), 1);
        let best = &survivors[0];
        assert_eq!(best.placements.len(), 1, "exactly one placement expected");

        let placement = &best.placements[0];
        assert_eq!(placement.word.chars().count(), 3);
        match placement.orientation {
            Horizontal => {
                assert!(placement.x + 3 <= 5);
                assert!(placement.y < 5);
            }
            Vertical => {
                assert!(placement.y + 3 <= 5);
                assert!(placement.x < 5);
            }
        }
        assert_eq!(best.fill_count, 3);
        assert_structurally_valid(best);
    }

    #[test]
    fn test_iterate_is_deterministic_for_a_seed() {
        let run = |seed: &str| {
            let mut generator = generator_with(three_letter_compilation(), |options| {
                options.width = 7;
                options.height = 7;
                options.selected_solutions = 3;
            });
            let mut population = vec![generator.generate(Some(seed))];
            for _ in 0..6 {
                population = generator.iterate(&population);
            }
            (
                render_grid(&population[0], '.'),
                population[0].placements.clone(),
            )
        };

        assert_eq!(run("reproducible"), run("reproducible"));
    }

    #[test]
    fn test_selection_bounds_dedup_and_order() {
        let mut generator = generator_with(three_letter_compilation(), |options| {
            options.width = 7;
            options.height = 7;
            options.selected_solutions = 4;
        });

        let mut population = vec![generator.generate(Some("selector-seed"))];
        for _ in 0..4 {
            population = generator.iterate(&population);

            assert!(!population.is_empty());
            assert!(population.len() <= 4);

            let hashes: HashSet<u64> = population.iter().map(|grid| grid.hash).collect();
            assert_eq!(hashes.len(), population.len(), "duplicate hashes survived");

            assert!(population
                .windows(2)
                .all(|pair| pair[0].score >= pair[1].score));
        }
    }

    #[test]
    fn test_select_collapses_identical_grids() {
        let compilation = three_letter_compilation();
        let generator = generator_with(compilation.clone(), |_| {});

        let mut grid = Grid::new(5, 5);
        place_for_test(&mut grid, &compilation, "CAT", Horizontal, 0, 0);

        let batch = vec![grid.clone(), grid.clone(), grid.clone(), Grid::new(5, 5)];
        let selected = generator.select(batch, 10);

        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].placements.len(), 1);
        assert!(selected[0].score > selected[1].score);

        let truncated = generator.select(vec![grid.clone(), Grid::new(5, 5)], 1);
        assert_eq!(truncated.len(), 1);
    }

    #[test]
    fn test_default_score_function_shape() {
        assert!((default_score_function(10, 3, 2) - 46.0 / 9.0).abs() < 1e-9);
        assert_eq!(default_score_function(0, 0, 0), 0.0);
    }

    #[test]
    fn test_fill_empty_spaces_noop_without_candidates() {
        let mut generator = generator_with(CompiledDictionary::default(), |options| {
            options.width = 5;
            options.height = 5;
        });

        let grid = generator.generate(Some("empty"));
        let result = generator.fill_empty_spaces(&[grid]);

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].fill_count, 0);
        assert!(result[0].placements.is_empty());
    }

    #[test]
    fn test_fill_completes_crossing_words() {
        let compilation = compile(
            &[vec![
                entry(&["CAT", "pet"]),
                entry(&["CIGAR", "smoke"]),
                entry(&["TIGER", "big cat"]),
            ]],
            None,
        );
        let mut generator = generator_with(compilation.clone(), |options| {
            options.width = 5;
            options.height = 5;
            options.selected_solutions = 1;
        });

        let mut grid = generator.generate(Some("filler"));
        place_for_test(&mut grid, &compilation, "CAT", Horizontal, 0, 0);

        let result = generator.fill_empty_spaces(&[grid]);
        let filled = &result[0];

        let words: HashSet<&str> = filled.placements.iter().map(|p| p.word.as_str()).collect();
        assert!(words.contains("CIGAR"));
        assert!(words.contains("TIGER"));
        assert_eq!(filled.fill_count, 11);
        assert_structurally_valid(filled);
    }

    #[test]
    fn test_fill_terminates_on_dense_grid() {
        let mut generator = generator_with(three_letter_compilation(), |options| {
            options.width = 3;
            options.height = 3;
        });

        let mut grid = generator.generate(Some("dense"));
        for cell in &mut grid.cells {
            cell.letter = Some('x');
            cell.part_of_horizontal = true;
            cell.part_of_vertical = true;
        }

        let result = generator.fill_empty_spaces(&[grid]);
        assert_eq!(result[0].fill_count, 9);
        assert!(result[0].placements.is_empty());
    }

    #[test]
    fn test_ignored_words_never_placed() {
        let mut generator = generator_with(three_letter_compilation(), |options| {
            options.width = 7;
            options.height = 7;
            options.ignored_words = vec!["CAT".to_string()];
        });

        let mut population = vec![generator.generate(Some("ignored"))];
        for _ in 0..10 {
            population = generator.iterate(&population);
        }
        let filled = generator.fill_empty_spaces(&population);

        for grid in population.iter().chain(&filled) {
            assert!(grid.placements.iter().all(|p| p.word != "CAT"));
        }
    }

    #[test]
    fn test_clue_projection_mirrors_placements() {
        let compilation = three_letter_compilation();
        let mut generator = generator_with(compilation.clone(), |options| {
            options.width = 5;
            options.height = 5;
        });

        let mut grid = generator.generate(Some("clues"));
        place_for_test(&mut grid, &compilation, "CAT", Horizontal, 0, 0);
        place_for_test(&mut grid, &compilation, "DOG", Horizontal, 0, 2);

        let clues = generator.project_clues(&grid);

        assert_eq!(clues.len(), 2);
        assert_eq!(clues[0].word, "CAT");
        assert_eq!(clues[0].question, "small feline pet");
        assert!(clues[0].horizontal);
        assert_eq!((clues[1].x, clues[1].y), (0, 2));
        assert_eq!(clues[1].question, "loyal companion");

        let json = serde_json::to_string(&clues).expect("clue export should serialize");
        assert!(json.contains("\"horizontal\":true"));
        assert!(json.contains("\"word\":\"CAT\""));
    }

    #[test]
    fn test_pad_token_and_listing() {
        assert_eq!(pad_token("cat", 5), "cat  ");
        assert_eq!(pad_token("elephant", 4), "elep");
        assert_eq!(pad_token("a\u{0007}b", 4), "a?b ");

        let listing = render_clue_listing(&[ClueRecord {
            x: 1,
            y: 2,
            horizontal: true,
            word: "CAT".to_string(),
            question: "pet".to_string(),
        }]);
        assert!(listing.contains("across"));
        assert!(listing.contains("CAT"));
        assert!(listing.contains("pet"));
    }

    #[test]
    fn test_statistics_count_attempts() {
        let mut generator = generator_with(three_letter_compilation(), |options| {
            options.width = 5;
            options.height = 5;
            options.words_per_iteration = 3;
            options.solutions_per_iteration = 4;
        });

        let grid = generator.generate(Some("stats"));
        generator.iterate(&[grid]);

        let statistics = generator.statistics();
        assert_eq!(statistics.attempts, 12);
        assert_eq!(statistics.placed + statistics.rejected, statistics.attempts);
    }

    #[test]
    fn test_retry_budget_escalates_then_finishes() {
        let mut generator = generator_with(CompiledDictionary::default(), |options| {
            options.width = 5;
            options.height = 5;
            options.finish_at = 5;
            options.words_on_border = 0.9;
            options.words_per_iteration = 12;
            options.solutions_per_iteration = 1;
            options.selected_solutions = 1;
        });

        let grid = generator.generate(Some("escalate"));
        let survivors = generator.iterate(&[grid]);

        assert!(survivors[0].is_finished());
        assert!(survivors[0].in_border_phase());
        assert_eq!(generator.statistics().border_escalations, 1);
        assert_eq!(generator.statistics().finished_grids, 1);
        assert_eq!(generator.statistics().attempts, 10);
    }

    #[test]
    fn test_disabled_border_forcing_finishes_directly() {
        let mut generator = generator_with(CompiledDictionary::default(), |options| {
            options.width = 5;
            options.height = 5;
            options.finish_at = 3;
            options.words_on_border = 0.0;
            options.words_per_iteration = 5;
            options.solutions_per_iteration = 1;
            options.selected_solutions = 1;
        });

        let grid = generator.generate(Some("no-border"));
        let survivors = generator.iterate(&[grid]);

        assert!(survivors[0].is_finished());
        assert!(!survivors[0].in_border_phase());
        assert_eq!(generator.statistics().border_escalations, 0);
    }

    #[test]
    fn test_adjacency_rules_reject_parallel_words() {
        let compilation = three_letter_compilation();
        let mut grid = Grid::new(5, 5);
        place_for_test(&mut grid, &compilation, "CAT", Horizontal, 0, 0);

        // Running directly beside an existing word without crossing it.
        assert!(collect_constraints(&grid, 0, 1, Horizontal, 3).is_none());
        // Overlapping a word of the same orientation.
        assert!(collect_constraints(&grid, 1, 0, Horizontal, 3).is_none());
        // Touching a same-orientation word end-to-end.
        assert!(end_cap_blocked(&grid, 3, 0, Horizontal, 2));

        // A proper crossing is legal and yields a letter constraint.
        let constraints =
            collect_constraints(&grid, 0, 0, Vertical, 3).expect("crossing should be legal");
        assert_eq!(constraints.to_vec(), vec![(0usize, 'C')]);
    }

    #[test]
    fn test_commit_normalizes_accented_letters() {
        let compilation = compile(&[vec![entry(&["café", "coffee place"])]], None);
        let mut generator = generator_with(compilation.clone(), |_| {});

        let mut grid = Grid::new(6, 6);
        let candidates = compilation.length_buckets[4].clone();
        let committed = generator.commit_candidate(&mut grid, &candidates, 0, 0, Horizontal);

        assert!(committed);
        assert_eq!(grid.cell(3, 0).letter, Some('e'));
        assert_eq!(grid.placements[0].word, "café");
    }

    #[test]
    fn test_structural_invariants_across_generations() {
        let mut generator = generator_with(three_letter_compilation(), |options| {
            options.width = 9;
            options.height = 9;
            options.words_per_iteration = 6;
            options.solutions_per_iteration = 12;
            options.selected_solutions = 4;
        });

        let mut population = vec![generator.generate(Some("invariants"))];
        for _ in 0..12 {
            population = generator.iterate(&population);
        }
        let filled = generator.fill_empty_spaces(&population);

        for grid in population.iter().chain(&filled) {
            assert_structurally_valid(grid);
        }
    }
}

//! Persona library: agent DNA, similarity matching, and disk persistence.
//!
//! A persona is the five-element "DNA" that specialises an agent: role with
//! seniority, domain context, an ordered methodology list, named constraints,
//! and an output-format mapping. Identity *is* the DNA — two personas with
//! identical DNA collapse to one record, enforced through a SHA-256
//! fingerprint of the canonical representation.
//!
//! # Disk format
//!
//! The library is a single append-structured `personas.yaml`: one YAML
//! document per [`PersonaRecord`], `---` separated. Usage-stat updates append
//! a fresh document rather than rewriting the file; on load the last document
//! per id wins. Writes flush before returning.
//!
//! ```text
//! ---
//! id: 3f1a…
//! dna:
//!   role: senior backend developer
//!   domain: development
//!   methodologies: [tdd, rest]
//!   constraints: {max_length: "400 words"}
//!   output_format: {style: markdown}
//! created_at: 2025-11-02T10:00:00Z
//! usage_count: 4
//! score: 0.82
//! last_used: 2025-11-30T08:12:44Z
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::taskweave::error::{EngineError, EngineResult};
use crate::taskweave::task::Domain;

/// Similarity at or above which an existing persona is reused instead of
/// generating a new one.
pub const MATCH_THRESHOLD: f64 = 0.7;

/// Smoothing factor of the exponential moving average over success scores.
pub const SCORE_ALPHA: f64 = 0.2;

/// The five-element specification that defines a specialised agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaDna {
    /// Role plus seniority, e.g. `"senior backend developer"`.
    pub role: String,
    /// Domain or industry context.
    pub domain: String,
    /// Ordered list of working methodologies.
    pub methodologies: Vec<String>,
    /// Named limits (key → value).
    pub constraints: BTreeMap<String, String>,
    /// Requested output shape (key → value).
    pub output_format: BTreeMap<String, String>,
}

impl PersonaDna {
    /// SHA-256 fingerprint of the canonical DNA representation. Two personas
    /// with equal DNA always produce the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.role.trim().to_lowercase().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.domain.trim().to_lowercase().as_bytes());
        hasher.update(b"\x1f");
        for m in &self.methodologies {
            hasher.update(m.trim().to_lowercase().as_bytes());
            hasher.update(b"\x1e");
        }
        hasher.update(b"\x1f");
        for (k, v) in &self.constraints {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\x1e");
        }
        hasher.update(b"\x1f");
        for (k, v) in &self.output_format {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\x1e");
        }
        format!("{:x}", hasher.finalize())
    }

    /// A serviceable stock DNA for a domain, used when persona generation is
    /// unavailable or fails.
    pub fn default_for(domain: Domain, role_hint: &str) -> Self {
        let role = if role_hint.is_empty() {
            format!("senior {} specialist", domain.as_str())
        } else {
            role_hint.to_string()
        };
        let methodologies = match domain {
            Domain::Development => vec!["iterative design".into(), "test-driven development".into()],
            Domain::Devops => vec!["infrastructure as code".into(), "staged rollout".into()],
            Domain::Data => vec!["exploratory analysis".into(), "validation against source".into()],
            Domain::Research => vec!["survey first".into(), "cite evidence".into()],
            Domain::Design => vec!["draft then refine".into()],
            Domain::Testing => vec!["risk-based coverage".into(), "regression first".into()],
            Domain::Security => vec!["threat modelling".into(), "least privilege".into()],
            Domain::Other => vec!["clarify then execute".into()],
        };
        let mut output_format = BTreeMap::new();
        output_format.insert("style".to_string(), "markdown".to_string());
        PersonaDna {
            role,
            domain: domain.as_str().to_string(),
            methodologies,
            constraints: BTreeMap::new(),
            output_format,
        }
    }
}

/// A persisted persona: DNA plus usage metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaRecord {
    pub id: String,
    pub dna: PersonaDna,
    pub created_at: DateTime<Utc>,
    pub usage_count: u64,
    /// Exponential-moving-average success score in `[0, 1]`.
    pub score: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl PersonaRecord {
    fn fresh(dna: PersonaDna) -> Self {
        Self {
            id: dna.fingerprint(),
            dna,
            created_at: Utc::now(),
            usage_count: 0,
            score: 0.5,
            last_used: None,
        }
    }
}

/// Jaccard similarity over two string collections, case-folded. Two empty
/// collections count as identical.
fn jaccard<'a, I, J>(a: I, b: J) -> f64
where
    I: IntoIterator<Item = &'a String>,
    J: IntoIterator<Item = &'a String>,
{
    let sa: HashSet<String> = a.into_iter().map(|s| s.trim().to_lowercase()).collect();
    let sb: HashSet<String> = b.into_iter().map(|s| s.trim().to_lowercase()).collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    inter / union
}

/// Word-level overlap for free-text elements (role, domain). Equal strings
/// score 1.0.
fn text_overlap(a: &str, b: &str) -> f64 {
    let words_a: Vec<String> = a.split_whitespace().map(|w| w.to_string()).collect();
    let words_b: Vec<String> = b.split_whitespace().map(|w| w.to_string()).collect();
    jaccard(words_a.iter(), words_b.iter())
}

/// Weighted similarity between two DNA values.
///
/// Weights: role 0.35, domain 0.25, methodologies 0.20, constraint keys 0.10,
/// output-format keys 0.10. Equal DNA yields exactly 1.0.
pub fn dna_similarity(a: &PersonaDna, b: &PersonaDna) -> f64 {
    let role = text_overlap(&a.role, &b.role);
    let domain = text_overlap(&a.domain, &b.domain);
    let methods = jaccard(a.methodologies.iter(), b.methodologies.iter());
    let constraint_keys_a: Vec<String> = a.constraints.keys().cloned().collect();
    let constraint_keys_b: Vec<String> = b.constraints.keys().cloned().collect();
    let constraints = jaccard(constraint_keys_a.iter(), constraint_keys_b.iter());
    let format_keys_a: Vec<String> = a.output_format.keys().cloned().collect();
    let format_keys_b: Vec<String> = b.output_format.keys().cloned().collect();
    let output = jaccard(format_keys_a.iter(), format_keys_b.iter());

    0.35 * role + 0.25 * domain + 0.20 * methods + 0.10 * constraints + 0.10 * output
}

/// Filter for [`PersonaStore::list`].
#[derive(Debug, Clone, Default)]
pub struct PersonaFilter {
    /// Keep only personas whose DNA domain contains this string.
    pub domain: Option<String>,
    /// Keep only personas with at least this many uses.
    pub min_uses: Option<u64>,
}

/// The persistent persona library.
///
/// The store exclusively owns persisted records; agents only ever hold a
/// read-only snapshot and report outcomes back by id.
pub struct PersonaStore {
    path: PathBuf,
    index: RwLock<HashMap<String, PersonaRecord>>,
}

impl PersonaStore {
    /// Open (or create) the library at `dir/personas.yaml`, loading every
    /// previously persisted record.
    pub fn open(dir: &Path) -> EngineResult<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| EngineError::PersonaStore(format!("cannot create {}: {}", dir.display(), e)))?;
        let path = dir.join("personas.yaml");
        let index = load_index(&path)?;
        Ok(Self {
            path,
            index: RwLock::new(index),
        })
    }

    /// Re-read the library file, replacing the in-memory index. Returns the
    /// number of personas loaded.
    pub async fn reload(&self) -> EngineResult<usize> {
        let fresh = load_index(&self.path)?;
        let count = fresh.len();
        *self.index.write().await = fresh;
        Ok(count)
    }

    /// Number of personas currently in the library.
    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Fetch a record by id.
    pub async fn get(&self, id: &str) -> Option<PersonaRecord> {
        self.index.read().await.get(id).cloned()
    }

    /// Find the closest persona to the given requirements.
    ///
    /// Returns the best record and its similarity. Ties break on higher
    /// success score, then more recent use. Callers compare the similarity
    /// against [`MATCH_THRESHOLD`] to decide reuse.
    pub async fn match_best(&self, requirements: &PersonaDna) -> Option<(PersonaRecord, f64)> {
        let index = self.index.read().await;
        let mut best: Option<(&PersonaRecord, f64)> = None;
        for record in index.values() {
            let sim = dna_similarity(&record.dna, requirements);
            let better = match best {
                None => true,
                Some((current, best_sim)) => {
                    if sim > best_sim {
                        true
                    } else if sim < best_sim {
                        false
                    } else if record.score != current.score {
                        record.score > current.score
                    } else {
                        record.last_used > current.last_used
                    }
                }
            };
            if better {
                best = Some((record, sim));
            }
        }
        best.map(|(r, s)| (r.clone(), s))
    }

    /// Insert a persona, collapsing onto the existing record when the DNA
    /// fingerprint already exists. Returns the (possibly pre-existing) id.
    pub async fn insert(&self, dna: PersonaDna) -> EngineResult<String> {
        let fingerprint = dna.fingerprint();
        {
            let index = self.index.read().await;
            if index.contains_key(&fingerprint) {
                return Ok(fingerprint);
            }
        }
        let record = PersonaRecord::fresh(dna);
        self.append_document(&record)?;
        let id = record.id.clone();
        self.index.write().await.insert(id.clone(), record);
        Ok(id)
    }

    /// Fold a success score into the persona's EMA, bump usage stats, and
    /// persist the updated record.
    pub async fn record_use(&self, id: &str, success_score: f64) -> EngineResult<()> {
        let mut index = self.index.write().await;
        let record = index
            .get_mut(id)
            .ok_or_else(|| EngineError::PersonaStore(format!("unknown persona id {}", id)))?;
        record.usage_count += 1;
        record.score = SCORE_ALPHA * success_score.clamp(0.0, 1.0) + (1.0 - SCORE_ALPHA) * record.score;
        record.last_used = Some(Utc::now());
        let snapshot = record.clone();
        drop(index);
        self.append_document(&snapshot)
    }

    /// List records matching the filter, best score first.
    pub async fn list(&self, filter: &PersonaFilter) -> Vec<PersonaRecord> {
        let index = self.index.read().await;
        let mut records: Vec<PersonaRecord> = index
            .values()
            .filter(|r| {
                if let Some(domain) = &filter.domain {
                    if !r.dna.domain.to_lowercase().contains(&domain.to_lowercase()) {
                        return false;
                    }
                }
                if let Some(min) = filter.min_uses {
                    if r.usage_count < min {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        records
    }

    /// Remove a persona. Rewrites the library file (deletion is rare; the
    /// append-structured format has no tombstones).
    pub async fn delete(&self, id: &str) -> EngineResult<bool> {
        let mut index = self.index.write().await;
        if index.remove(id).is_none() {
            return Ok(false);
        }
        let mut out = String::new();
        for record in index.values() {
            out.push_str("---\n");
            out.push_str(
                &serde_yaml::to_string(record)
                    .map_err(|e| EngineError::PersonaStore(e.to_string()))?,
            );
        }
        fs::write(&self.path, out)
            .map_err(|e| EngineError::PersonaStore(format!("rewrite failed: {}", e)))?;
        Ok(true)
    }

    fn append_document(&self, record: &PersonaRecord) -> EngineResult<()> {
        let doc = serde_yaml::to_string(record)
            .map_err(|e| EngineError::PersonaStore(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| EngineError::PersonaStore(format!("open failed: {}", e)))?;
        file.write_all(b"---\n")
            .and_then(|_| file.write_all(doc.as_bytes()))
            .and_then(|_| file.sync_all())
            .map_err(|e| EngineError::PersonaStore(format!("append failed: {}", e)))
    }
}

/// Parse the multi-document library file. The last document per id wins,
/// matching the append-structured update discipline.
fn load_index(path: &Path) -> EngineResult<HashMap<String, PersonaRecord>> {
    let mut index = HashMap::new();
    if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|e| EngineError::PersonaStore(format!("cannot read library: {}", e)))?;
        for document in serde_yaml::Deserializer::from_str(&raw) {
            let record = PersonaRecord::deserialize(document)
                .map_err(|e| EngineError::PersonaStore(format!("corrupt persona document: {}", e)))?;
            index.insert(record.id.clone(), record);
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dna(role: &str, domain: &str) -> PersonaDna {
        PersonaDna {
            role: role.to_string(),
            domain: domain.to_string(),
            methodologies: vec!["tdd".into()],
            constraints: BTreeMap::new(),
            output_format: BTreeMap::new(),
        }
    }

    #[test]
    fn test_identical_dna_scores_one() {
        let a = dna("senior backend developer", "development");
        assert!((dna_similarity(&a, &a.clone()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fingerprint_collapses_whitespace_and_case() {
        let a = dna("Senior Backend Developer", "development");
        let b = dna("senior backend developer", "development");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_disjoint_dna_scores_low() {
        let a = dna("senior backend developer", "development");
        let mut b = dna("junior graphic designer", "design");
        b.methodologies = vec!["moodboards".into()];
        assert!(dna_similarity(&a, &b) < MATCH_THRESHOLD);
    }
}

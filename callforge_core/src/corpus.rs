use crate::encoding::{DecodeError, deserialize};
use crate::prog::Prog;
use crate::target::Target;
use rand_core::RngCore;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested program ID was not found within the corpus.
    #[error("Program ID {0} not found in corpus")]
    InputNotFound(usize),

    /// An operation could not be performed because the corpus is empty.
    #[error("Corpus is empty, cannot select a program")]
    CorpusIsEmpty,

    /// Reading a seed file or directory failed.
    /// Contains a string describing the underlying I/O error.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// A seed file does not hold a valid program for the target.
    #[error("Corpus seed decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A program for a different target was offered to the corpus.
    #[error("Program for {found} does not belong in a {expected} corpus")]
    TargetMismatch { expected: String, found: String },
}

/// A collection of programs kept as mutation and splicing material.
///
/// Programs are identified by the index they were stored at. Implementations
/// decide how duplicates are handled.
pub trait Corpus: Send + Sync {
    /// Adds a program along with a note on where it came from.
    ///
    /// # Returns
    /// `Ok(Some(id))` for a newly stored program, `Ok(None)` when an identical
    /// program is already present.
    fn add(&mut self, prog: Prog, source: String) -> Result<Option<usize>, CorpusError>;

    /// The program stored under `id` and its source note.
    fn get(&self, id: usize) -> Option<(&Prog, &str)>;

    /// Picks a stored program uniformly.
    ///
    /// # Returns
    /// The ID and program, or `None` if the corpus is empty.
    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, &Prog)>;

    /// Every stored program, in insertion order.
    fn programs(&self) -> &[Prog];

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads seed programs from files, or from the files directly inside
    /// directories (not recursive). Each file holds one program in text form.
    ///
    /// # Returns
    /// The number of newly stored programs; duplicates are not counted.
    fn load_initial_seeds(
        &mut self,
        target: &Arc<Target>,
        seed_paths: &[PathBuf],
    ) -> Result<usize, CorpusError>;
}

/// An in-memory corpus that drops programs whose text form it has already seen.
#[derive(Debug)]
pub struct ProgCorpus {
    target: Arc<Target>,
    progs: Vec<Prog>,
    sources: Vec<String>,
    seen: HashSet<[u8; 16]>,
}

impl ProgCorpus {
    /// Creates an empty corpus for programs of `target`.
    pub fn new(target: Arc<Target>) -> Self {
        Self {
            target,
            progs: Vec::new(),
            sources: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Same as [`Corpus::get`], but fails with [`CorpusError::InputNotFound`].
    pub fn try_get(&self, id: usize) -> Result<&Prog, CorpusError> {
        self.progs.get(id).ok_or(CorpusError::InputNotFound(id))
    }

    /// Same as [`Corpus::random_select`], but fails with [`CorpusError::CorpusIsEmpty`].
    pub fn try_random_select(&self, rng: &mut dyn RngCore) -> Result<(usize, &Prog), CorpusError> {
        self.random_select(rng).ok_or(CorpusError::CorpusIsEmpty)
    }

    fn load_file(&mut self, path: &Path) -> Result<bool, CorpusError> {
        let text = fs::read_to_string(path)
            .map_err(|e| CorpusError::Io(format!("Failed to read seed file {:?}: {}", path, e)))?;
        let prog = deserialize(&self.target, &text).inspect_err(|e| {
            log::warn!("seed file {:?} is not a valid program: {}", path, e);
        })?;
        Ok(self
            .add(prog, format!("Initial seed file: {:?}", path))?
            .is_some())
    }
}

impl Corpus for ProgCorpus {
    fn add(&mut self, prog: Prog, source: String) -> Result<Option<usize>, CorpusError> {
        if prog.target.os != self.target.os || prog.target.arch != self.target.arch {
            return Err(CorpusError::TargetMismatch {
                expected: format!("{}/{}", self.target.os, self.target.arch),
                found: format!("{}/{}", prog.target.os, prog.target.arch),
            });
        }
        let digest = md5::compute(prog.serialize().as_bytes()).0;
        if !self.seen.insert(digest) {
            log::trace!("dropping duplicate program from {}", source);
            return Ok(None);
        }
        let id = self.progs.len();
        self.progs.push(prog);
        self.sources.push(source);
        Ok(Some(id))
    }

    fn get(&self, id: usize) -> Option<(&Prog, &str)> {
        Some((self.progs.get(id)?, self.sources.get(id)?.as_str()))
    }

    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, &Prog)> {
        if self.is_empty() {
            return None;
        }
        let index = rng.next_u64() as usize % self.progs.len();
        self.progs.get(index).map(|prog| (index, prog))
    }

    fn programs(&self) -> &[Prog] {
        &self.progs
    }

    fn len(&self) -> usize {
        self.progs.len()
    }

    fn load_initial_seeds(
        &mut self,
        target: &Arc<Target>,
        seed_paths: &[PathBuf],
    ) -> Result<usize, CorpusError> {
        if target.os != self.target.os || target.arch != self.target.arch {
            return Err(CorpusError::TargetMismatch {
                expected: format!("{}/{}", self.target.os, self.target.arch),
                found: format!("{}/{}", target.os, target.arch),
            });
        }
        let mut loaded_count = 0;
        for path in seed_paths {
            if path.is_file() {
                if self.load_file(path)? {
                    loaded_count += 1;
                }
            } else if path.is_dir() {
                let mut files = Vec::new();
                for entry in fs::read_dir(path).map_err(|e| {
                    CorpusError::Io(format!("Failed to read seed directory {:?}: {}", path, e))
                })? {
                    let entry = entry.map_err(|e| {
                        CorpusError::Io(format!("Error reading entry in {:?}: {}", path, e))
                    })?;
                    if entry.path().is_file() {
                        files.push(entry.path());
                    }
                }
                files.sort();
                for file in files {
                    if self.load_file(&file)? {
                        loaded_count += 1;
                    }
                }
            } else {
                return Err(CorpusError::Io(format!(
                    "Seed path {:?} is neither a file nor a directory",
                    path
                )));
            }
        }
        log::debug!("loaded {} seed programs", loaded_count);
        Ok(loaded_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::get_target;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn add_get_len_and_dedup() {
        let target = get_target("test", "64").unwrap();
        let mut corpus = ProgCorpus::new(Arc::clone(&target));
        assert!(corpus.is_empty());

        let first = deserialize(&target, "mutate0()\n").unwrap();
        let second = deserialize(&target, "mutate1()\nmutate2()\n").unwrap();
        assert_eq!(corpus.add(first.clone(), "a".to_string()).unwrap(), Some(0));
        assert_eq!(corpus.add(second, "b".to_string()).unwrap(), Some(1));
        assert_eq!(corpus.add(first, "c".to_string()).unwrap(), None, "duplicate must be dropped");
        assert_eq!(corpus.len(), 2);

        let (prog, source) = corpus.get(1).unwrap();
        assert_eq!(prog.summary(), "mutate1-mutate2");
        assert_eq!(source, "b");
        assert!(corpus.get(2).is_none());
        assert!(matches!(corpus.try_get(5), Err(CorpusError::InputNotFound(5))));
        assert_eq!(corpus.programs().len(), 2);
    }

    #[test]
    fn random_select_covers_all_programs() {
        let target = get_target("test", "64").unwrap();
        let mut corpus = ProgCorpus::new(Arc::clone(&target));
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert!(corpus.random_select(&mut rng).is_none());
        assert!(matches!(corpus.try_random_select(&mut rng), Err(CorpusError::CorpusIsEmpty)));

        for name in ["mutate0", "mutate1", "mutate2"] {
            let prog = deserialize(&target, &format!("{}()\n", name)).unwrap();
            corpus.add(prog, name.to_string()).unwrap();
        }
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let (id, prog) = corpus.random_select(&mut rng).unwrap();
            assert_eq!(corpus.get(id).unwrap().0, prog);
            seen.insert(id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn rejects_programs_for_other_targets() {
        let test = get_target("test", "64").unwrap();
        let linux = get_target("linux", "amd64").unwrap();
        let mut corpus = ProgCorpus::new(test);
        let prog = deserialize(&linux, "getpid()\n").unwrap();
        assert!(matches!(
            corpus.add(prog, "x".to_string()),
            Err(CorpusError::TargetMismatch { .. })
        ));
    }

    #[test]
    fn load_initial_seeds_from_files_and_dirs() {
        let target = get_target("linux", "amd64").unwrap();
        let dir = tempdir().unwrap();
        let single = dir.path().join("single.prog");
        fs::write(&single, "sched_yield()\n").unwrap();
        let sub = dir.path().join("seeds");
        fs::create_dir(&sub).unwrap();
        let mut f = fs::File::create(sub.join("a.prog")).unwrap();
        writeln!(f, "# comment\ngetpid()").unwrap();
        fs::write(sub.join("b.prog"), "sched_yield()\n").unwrap();
        fs::create_dir(sub.join("nested")).unwrap();

        let mut corpus = ProgCorpus::new(Arc::clone(&target));
        let loaded = corpus.load_initial_seeds(&target, &[single, sub]).unwrap();
        assert_eq!(loaded, 2, "the duplicate sched_yield must not be counted");
        assert_eq!(corpus.programs()[1].summary(), "getpid");
    }

    #[test]
    fn load_initial_seeds_reports_bad_seeds() {
        let target = get_target("linux", "amd64").unwrap();
        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.prog");
        fs::write(&bad, "no_such_call()\n").unwrap();
        let mut corpus = ProgCorpus::new(Arc::clone(&target));
        assert!(matches!(
            corpus.load_initial_seeds(&target, &[bad]),
            Err(CorpusError::Decode(DecodeError::UnknownCall { .. }))
        ));
        assert!(matches!(
            corpus.load_initial_seeds(&target, &[dir.path().join("missing")]),
            Err(CorpusError::Io(_))
        ));
    }
}

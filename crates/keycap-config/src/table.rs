//! Mapping tables: ordered mapping records indexed by input signature

use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Write};
use std::path::Path;

use crate::error::{LoadError, TableError};
use crate::model::{modifier_prefix, IODefinition, IOPairDefinition, MODIFIER_MASK};
use crate::vk;

/// Lookup key of a mapping: the input's Alt/Control/Shift bits plus its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature {
    modifiers: u8,
    code: u8,
}

impl Signature {
    pub fn new(modifiers: u8, code: u8) -> Self {
        Self {
            modifiers: modifiers & MODIFIER_MASK,
            code,
        }
    }

    pub fn of(input: &IODefinition) -> Self {
        Self::new(input.modifiers(), input.value())
    }

    pub fn modifiers(&self) -> u8 {
        self.modifiers
    }

    pub fn code(&self) -> u8 {
        self.code
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", modifier_prefix(self.modifiers), vk::label(self.code))
    }
}

/// Ordered mapping records with an O(1) signature index.
///
/// When two records share a signature the earlier one wins; the later one is
/// kept in [`pairs`](Self::pairs) but never matched.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    pairs: Vec<IOPairDefinition>,
    index: HashMap<Signature, usize>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: Vec<IOPairDefinition>) -> Self {
        let mut table = Self {
            pairs,
            index: HashMap::new(),
        };
        table.build_index();
        table
    }

    /// Load a mapping file. Nothing is returned unless every record decodes.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(LoadError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        if metadata.len() == 0 {
            return Err(LoadError::FileEmpty {
                path: path.to_path_buf(),
            });
        }

        let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let table = Self::from_bytes(&bytes)?;
        tracing::debug!("Loaded {} mapping(s) from {}", table.len(), path.display());
        Ok(table)
    }

    /// Decode records until the end of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        let mut cursor = Cursor::new(bytes);
        let mut pairs = Vec::new();

        loop {
            let offset = cursor.position() as usize;
            match IOPairDefinition::decode_next(&mut cursor) {
                Ok(Some(pair)) => pairs.push(pair),
                Ok(None) => break,
                Err(source) => return Err(LoadError::Malformed { offset, source }),
            }
        }

        Ok(Self::from_pairs(pairs))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.pairs.iter().flat_map(IOPairDefinition::encode).collect()
    }

    /// Write the table next to `path` and rename it into place.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, path)?;
        tracing::debug!("Saved {} mapping(s) to {}", self.len(), path.display());
        Ok(())
    }

    pub fn lookup(&self, signature: &Signature) -> Option<&IOPairDefinition> {
        self.index.get(signature).map(|&i| &self.pairs[i])
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[IOPairDefinition] {
        &self.pairs
    }

    pub fn iter(&self) -> impl Iterator<Item = &IOPairDefinition> {
        self.pairs.iter()
    }

    /// Append a record, rejecting an exact duplicate of an existing one.
    pub fn push(&mut self, pair: IOPairDefinition) -> Result<(), TableError> {
        if let Some(index) = self.pairs.iter().position(|p| *p == pair) {
            return Err(TableError::DuplicatePair { index });
        }
        let signature = Signature::of(pair.input());
        let index = self.pairs.len();
        self.pairs.push(pair);
        self.index.entry(signature).or_insert(index);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Option<IOPairDefinition> {
        if index >= self.pairs.len() {
            return None;
        }
        let pair = self.pairs.remove(index);
        self.build_index();
        Some(pair)
    }

    /// Signatures bound by more than one record, with the indices of each.
    pub fn conflicts(&self) -> Vec<(Signature, Vec<usize>)> {
        let mut by_signature: HashMap<Signature, Vec<usize>> = HashMap::new();
        for (i, pair) in self.pairs.iter().enumerate() {
            by_signature
                .entry(Signature::of(pair.input()))
                .or_default()
                .push(i);
        }

        let mut conflicts: Vec<_> = by_signature
            .into_iter()
            .filter(|(_, indices)| indices.len() > 1)
            .collect();
        conflicts.sort_by_key(|(_, indices)| indices[0]);
        conflicts
    }

    fn build_index(&mut self) {
        self.index.clear();
        let mut shadowed = 0;
        for (i, pair) in self.pairs.iter().enumerate() {
            let signature = Signature::of(pair.input());
            if self.index.contains_key(&signature) {
                shadowed += 1;
                tracing::debug!("Record #{} ({}) is shadowed by an earlier record", i, signature);
            } else {
                self.index.insert(signature, i);
            }
        }
        if shadowed > 0 {
            tracing::warn!(
                "{} mapping record(s) share an input with an earlier record and will never fire",
                shadowed
            );
        }
    }
}

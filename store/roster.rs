use ahash::AHashMap;
use itertools::Itertools;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub type PatientId = u32;

/// The ordered list of patients whose array positions define bit indices in every mask
/// of one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientRoster {
    ids: Vec<PatientId>,
    positions: AHashMap<PatientId, Vec<usize>>,
}

impl PatientRoster {
    pub fn new(ids: Vec<PatientId>) -> Self {
        let mut positions: AHashMap<PatientId, Vec<usize>> = AHashMap::with_capacity(ids.len());
        for (index, &id) in ids.iter().enumerate() {
            positions.entry(id).or_default().push(index);
        }
        Self { ids, positions }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[inline]
    pub fn ids(&self) -> &[PatientId] {
        &self.ids
    }

    /// Every bit index held by `id`. Concatenated rosters may list an id more than once.
    pub fn positions_of(&self, id: PatientId) -> &[usize] {
        self.positions.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, id: PatientId) -> bool {
        self.positions.contains_key(&id)
    }

    /// `self`'s patients followed by `other`'s.
    pub fn concat(&self, other: &PatientRoster) -> PatientRoster {
        let mut ids = Vec::with_capacity(self.len() + other.len());
        ids.extend_from_slice(&self.ids);
        ids.extend_from_slice(&other.ids);
        PatientRoster::new(ids)
    }

    /// Ids present in both rosters, in `self`'s order.
    pub fn overlap(&self, other: &PatientRoster) -> Vec<PatientId> {
        self.ids
            .iter()
            .copied()
            .filter(|id| other.contains(*id))
            .unique()
            .collect()
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for id in &self.ids {
            writeln!(writer, "{id}")?;
        }
        writer.flush()
    }

    pub fn read_from(path: &Path) -> io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut ids = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let id = trimmed.parse::<PatientId>().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "{}:{}: invalid patient id '{trimmed}': {e}",
                        path.display(),
                        line_no + 1
                    ),
                )
            })?;
            ids.push(id);
        }
        Ok(Self::new(ids))
    }
}

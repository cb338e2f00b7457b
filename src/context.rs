//! Per-run state shared by the decoders of one protocol: loaded category definitions, the
//! categories seen in the broadcast, text dictionaries, and time references.

use crate::decode::huffman::HuffmanDictionary;
use crate::record::{CategoryCode, CategoryRecord};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeMap;
use std::io::{self, BufRead};

/// Problems reading a category definition file or a text dictionary.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
}

/// Category code to description mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryTable {
    entries: BTreeMap<CategoryCode, String>,
}

impl CategoryTable {
    /// Read definitions, one per line, as either `tag=description` or
    /// `category,subCategory=description`.  Numbers may be decimal or `0x` hexadecimal.  Blank
    /// lines and lines starting with `#` are skipped.
    pub fn parse<R: BufRead>(reader: R) -> Result<CategoryTable, ConfigError> {
        let mut table = CategoryTable::default();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let invalid = |reason: &str| ConfigError::InvalidLine {
                line: index + 1,
                reason: reason.to_string(),
            };
            let (code, description) = line.split_once('=').ok_or_else(|| invalid("missing '='"))?;
            let code = match code.split_once(',') {
                Some((cat, sub)) => CategoryCode::Pair(
                    parse_number(cat).ok_or_else(|| invalid("bad category"))?,
                    parse_number(sub).ok_or_else(|| invalid("bad sub-category"))?,
                ),
                None => CategoryCode::Single(parse_number(code).ok_or_else(|| invalid("bad tag"))?),
            };
            table.insert(code, description.trim());
        }
        Ok(table)
    }

    pub fn insert(&mut self, code: CategoryCode, description: impl Into<String>) {
        self.entries.insert(code, description.into());
    }

    pub fn lookup(&self, code: CategoryCode) -> Option<&str> {
        self.entries.get(&code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CategoryCode, &str)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

fn parse_number<T: TryFrom<u32>>(s: &str) -> Option<T> {
    let s = s.trim();
    let v = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => s.parse::<u32>().ok()?,
    };
    T::try_from(v).ok()
}

/// Leap seconds between GPS and UTC time at the time of writing, used until an ATSC system time
/// table says otherwise.
pub const DEFAULT_GPS_UTC_OFFSET: u8 = 18;

/// Everything the decoders of one protocol run need besides the sections themselves.
#[derive(Debug, Clone)]
pub struct ProtocolContext {
    /// Category definitions loaded from file.
    pub categories: CategoryTable,
    /// Category definitions learned from theme tables in the broadcast.
    pub broadcast_categories: CategoryTable,
    /// Times resolved relative to the current week (MediaHighway 1) use this as 'now'.
    pub reference_time: DateTime<Utc>,
    pub gps_utc_offset: u8,
    pub opentv_dictionary: Option<HuffmanDictionary>,
    /// Dish Network dictionaries, selected per text field.
    pub dish_dictionary_128: Option<HuffmanDictionary>,
    pub dish_dictionary_255: Option<HuffmanDictionary>,
    /// Whether to apply the MediaHighway text fix-up to decoded strings.
    pub apply_text_fixups: bool,
    usage: BTreeMap<CategoryCode, u32>,
    undefined: BTreeMap<CategoryCode, CategoryRecord>,
}

impl Default for ProtocolContext {
    fn default() -> Self {
        ProtocolContext::new(Utc::now())
    }
}

impl ProtocolContext {
    pub fn new(reference_time: DateTime<Utc>) -> ProtocolContext {
        ProtocolContext {
            categories: CategoryTable::default(),
            broadcast_categories: CategoryTable::default(),
            reference_time,
            gps_utc_offset: DEFAULT_GPS_UTC_OFFSET,
            opentv_dictionary: None,
            dish_dictionary_128: None,
            dish_dictionary_255: None,
            apply_text_fixups: false,
            usage: BTreeMap::new(),
            undefined: BTreeMap::new(),
        }
    }

    pub fn with_categories(mut self, categories: CategoryTable) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_opentv_dictionary(mut self, dict: HuffmanDictionary) -> Self {
        self.opentv_dictionary = Some(dict);
        self
    }

    pub fn with_dish_dictionaries(
        mut self,
        dict_128: HuffmanDictionary,
        dict_255: HuffmanDictionary,
    ) -> Self {
        self.dish_dictionary_128 = Some(dict_128);
        self.dish_dictionary_255 = Some(dict_255);
        self
    }

    pub fn with_text_fixups(mut self, apply: bool) -> Self {
        self.apply_text_fixups = apply;
        self
    }

    /// Remember a category definition carried by the broadcast itself.
    pub fn learn_category(&mut self, code: CategoryCode, description: &str) {
        self.broadcast_categories.insert(code, description);
        self.undefined.remove(&code);
    }

    /// Note a use of `code` by the event titled `sample`, returning the description if the code
    /// is defined.  Loaded definitions are preferred over broadcast ones.  An unknown code is
    /// recorded as undefined, with the first event seen using it as the sample.
    pub fn categorise(&mut self, code: CategoryCode, sample: &str) -> Option<String> {
        let description = self
            .categories
            .lookup(code)
            .or_else(|| self.broadcast_categories.lookup(code))
            .map(str::to_string);
        match description {
            Some(description) => {
                *self.usage.entry(code).or_insert(0) += 1;
                Some(description)
            }
            None => {
                let entry = self.undefined.entry(code).or_insert_with(|| {
                    debug!("undefined category {} first used by {:?}", code, sample);
                    CategoryRecord {
                        code,
                        description: String::new(),
                        sample_event: Some(sample.to_string()),
                        used_count: 0,
                    }
                });
                entry.used_count += 1;
                None
            }
        }
    }

    pub fn used_count(&self, code: CategoryCode) -> u32 {
        self.usage.get(&code).copied().unwrap_or(0)
    }

    /// Codes seen in the broadcast for which there is no definition.
    pub fn undefined_categories(&self) -> impl Iterator<Item = &CategoryRecord> + '_ {
        self.undefined.values()
    }

    /// Every defined category that was used, with its usage count.
    pub fn category_usage(&self) -> Vec<CategoryRecord> {
        self.usage
            .iter()
            .filter_map(|(&code, &used_count)| {
                let description = self
                    .categories
                    .lookup(code)
                    .or_else(|| self.broadcast_categories.lookup(code))?;
                Some(CategoryRecord {
                    code,
                    description: description.to_string(),
                    sample_event: None,
                    used_count,
                })
            })
            .collect()
    }

    /// Apply the MediaHighway fix-up, if enabled.
    pub fn fix_text(&self, text: String) -> String {
        if self.apply_text_fixups {
            crate::decode::fixup::fix_string(&text)
        } else {
            text
        }
    }

    /// Forget per-frequency usage statistics, keeping definitions and dictionaries.
    pub fn reset_usage(&mut self) {
        self.usage.clear();
        self.undefined.clear();
        self.broadcast_categories = CategoryTable::default();
    }
}

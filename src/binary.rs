//! The immutable snapshot produced by the container decoder and consumed by the VM.
use indexmap::IndexMap;

/// A scene or function entry: `symbol` indexes `string_table`; `instruction_indices[0]`
/// is the body entry point, and pairs `(indices[1], indices[2]), ...` are
/// flag-initializer sub-programs (value-producing, then name-producing).
#[derive(Debug, Clone)]
pub struct CodeEntry {
    pub symbol: u32,
    pub instruction_indices: Vec<i32>,
}

impl CodeEntry {
    pub fn entry_point(&self) -> i32 {
        self.instruction_indices[0]
    }

    /// Flag initializer pairs following the entry point, in declaration order.
    pub fn flag_initializers(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.instruction_indices[1..]
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
    }
}

#[derive(Debug, Clone)]
pub struct DefinitionEntry {
    pub symbol: u32,
    pub reference: u32,
    pub instruction_index: i32,
}

/// Immutable parsed representation of a DXB container.
///
/// Never mutated after construction except by [`Binary::load_translation_file`],
/// which replaces `translation_table` and signals the VM to rebuild its
/// definitions cache.
#[derive(Debug, Clone)]
pub struct Binary {
    pub translation_loaded: bool,
    pub string_table: Vec<String>,
    pub translation_table: Vec<String>,
    pub instructions: Vec<u8>,
    pub external_function_list: Vec<u32>,
    pub scenes: Vec<CodeEntry>,
    pub functions: Vec<CodeEntry>,
    pub definitions: Vec<DefinitionEntry>,
}

impl Binary {
    /// `(ref & (1<<31)) != 0` selects `string_table`; else the full 32 bits
    /// index `translation_table`.
    pub fn resolve_reference(&self, reference: u32) -> Option<&str> {
        if reference & (1 << 31) != 0 {
            let index = (reference & !(1 << 31)) as usize;
            self.string_table.get(index).map(String::as_str)
        } else {
            self.translation_table.get(reference as usize).map(String::as_str)
        }
    }

    pub fn find_scene(&self, name: &str) -> Option<&CodeEntry> {
        self.scenes
            .iter()
            .find(|s| self.string_table.get(s.symbol as usize).map(String::as_str) == Some(name))
    }

    pub fn find_function(&self, name: &str) -> Option<&CodeEntry> {
        self.functions
            .iter()
            .find(|f| self.string_table.get(f.symbol as usize).map(String::as_str) == Some(name))
    }

    pub fn find_definition(&self, name: &str) -> Option<&DefinitionEntry> {
        self.definitions
            .iter()
            .find(|d| self.string_table.get(d.symbol as usize).map(String::as_str) == Some(name))
    }

    /// Replaces the translation table (e.g. from an overlaid translation file)
    /// and marks the binary as carrying loaded translations. The VM is
    /// responsible for rebuilding its definitions cache afterward.
    pub fn load_translation_strings(&mut self, lines: Vec<String>) {
        self.translation_table = lines;
        self.translation_loaded = true;
    }
}

/// Parses a translation file's text into ordered translation-table entries.
/// Lines beginning with `#` or `@`, or that trim to empty, are skipped.
pub fn parse_translation_file(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !(trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('@'))
        })
        .map(|line| line.to_string())
        .collect()
}

/// Convenience alias used by the resolver cache: symbol name -> resolved string.
pub type DefinitionsCache = IndexMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_tag_selects_string_table_on_high_bit() {
        let binary = Binary {
            translation_loaded: false,
            string_table: vec!["internal".to_string()],
            translation_table: vec!["translated".to_string()],
            instructions: vec![],
            external_function_list: vec![],
            scenes: vec![],
            functions: vec![],
            definitions: vec![],
        };
        assert_eq!(binary.resolve_reference(1 << 31), Some("internal"));
        assert_eq!(binary.resolve_reference(0), Some("translated"));
    }

    #[test]
    fn flag_initializer_pairs_walk_in_order() {
        let entry = CodeEntry {
            symbol: 0,
            instruction_indices: vec![10, 20, 30, 40, 50],
        };
        assert_eq!(entry.entry_point(), 10);
        let pairs: Vec<_> = entry.flag_initializers().collect();
        assert_eq!(pairs, vec![(20, 30), (40, 50)]);
    }

    #[test]
    fn translation_file_skips_comments_and_blank_lines() {
        let text = "# comment\n@meta\n\nHello\nWorld\n";
        let lines = parse_translation_file(text);
        assert_eq!(lines, vec!["Hello".to_string(), "World".to_string()]);
    }
}

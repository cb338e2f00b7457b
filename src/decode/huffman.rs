//! Prefix-code text decompression, as used by OpenTV and Dish Network guide text.
//!
//! Dictionaries are not broadcast; they are supplied as text files with one `symbol=bits` entry
//! per line, for example
//!
//! ```text
//! # comment
//! e=000
//! \x20=001
//! STOP=0100
//! ESCAPE=0101
//! ```
//!
//! A symbol is a single character, a `\xNN` byte escape, `STOP` (end of string) or `ESCAPE` (the
//! next 8 bits are a literal byte).

use super::DecodeError;
use crate::context::ConfigError;
use std::io::BufRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbol {
    Char(char),
    Stop,
    Escape,
}

#[derive(Debug, Clone)]
enum Node {
    Branch([Option<usize>; 2]),
    Leaf(Symbol),
}

/// A prefix-code tree built from a dictionary file.
#[derive(Debug, Clone)]
pub struct HuffmanDictionary {
    nodes: Vec<Node>,
}

impl HuffmanDictionary {
    pub fn parse<R: BufRead>(reader: R) -> Result<HuffmanDictionary, ConfigError> {
        let mut dict = HuffmanDictionary {
            nodes: vec![Node::Branch([None, None])],
        };
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
            if line.is_empty() || (line.starts_with('#') && !line[1..].starts_with('=')) {
                continue;
            }
            let invalid = |reason: &str| ConfigError::InvalidLine {
                line: index + 1,
                reason: reason.to_string(),
            };
            let (symbol, bits) = line.rsplit_once('=').ok_or_else(|| invalid("missing '='"))?;
            let symbol = parse_symbol(symbol).ok_or_else(|| invalid("bad symbol"))?;
            if bits.is_empty() || !bits.bytes().all(|b| b == b'0' || b == b'1') {
                return Err(invalid("bits must be a string of 0 and 1"));
            }
            dict.insert(bits, symbol)
                .map_err(|_| invalid("code conflicts with an earlier entry"))?;
        }
        Ok(dict)
    }

    fn insert(&mut self, bits: &str, symbol: Symbol) -> Result<(), ()> {
        let mut node = 0;
        for (i, bit) in bits.bytes().enumerate() {
            let branch = usize::from(bit == b'1');
            let last = i == bits.len() - 1;
            let next = match self.nodes[node] {
                Node::Leaf(_) => return Err(()),
                Node::Branch(children) => children[branch],
            };
            node = match next {
                Some(child) => {
                    if last {
                        return Err(());
                    }
                    child
                }
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(if last {
                        Node::Leaf(symbol)
                    } else {
                        Node::Branch([None, None])
                    });
                    if let Node::Branch(ref mut children) = self.nodes[node] {
                        children[branch] = Some(child);
                    }
                    child
                }
            };
        }
        Ok(())
    }

    /// Decode the bit string in `data` (most significant bit first) until `STOP`, the end of the
    /// data, or `max_chars` characters have been produced.
    pub fn decode(
        &self,
        field: &'static str,
        data: &[u8],
        max_chars: Option<usize>,
    ) -> Result<String, DecodeError> {
        let mut out = String::new();
        let mut count = 0;
        let total_bits = data.len() * 8;
        let bit = |i: usize| data[i / 8] >> (7 - (i % 8)) & 1;
        let mut pos = 0;
        let mut node = 0;
        while pos < total_bits {
            if max_chars.map(|m| count >= m).unwrap_or(false) {
                break;
            }
            let branch = bit(pos) as usize;
            pos += 1;
            let child = match self.nodes[node] {
                Node::Branch(children) => children[branch],
                Node::Leaf(_) => None,
            };
            let child = child.ok_or_else(|| DecodeError::InvalidField {
                field,
                reason: format!("no dictionary entry for code ending at bit {}", pos),
            })?;
            match self.nodes[child] {
                Node::Branch(_) => node = child,
                Node::Leaf(Symbol::Char(c)) => {
                    out.push(c);
                    count += 1;
                    node = 0;
                }
                Node::Leaf(Symbol::Stop) => break,
                Node::Leaf(Symbol::Escape) => {
                    if pos + 8 > total_bits {
                        return Err(DecodeError::Truncated {
                            field,
                            needed: (pos + 8 + 7) / 8,
                            available: data.len(),
                        });
                    }
                    let byte = (0..8).fold(0u8, |acc, i| acc << 1 | bit(pos + i));
                    pos += 8;
                    out.push(byte as char);
                    count += 1;
                    node = 0;
                }
            }
        }
        Ok(out)
    }
}

fn parse_symbol(s: &str) -> Option<Symbol> {
    match s {
        "STOP" => Some(Symbol::Stop),
        "ESCAPE" => Some(Symbol::Escape),
        _ if s.len() == 4 && s.starts_with("\\x") => u8::from_str_radix(&s[2..], 16)
            .ok()
            .map(|b| Symbol::Char(b as char)),
        _ => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(Symbol::Char(c)),
                _ => None,
            }
        }
    }
}

//! A MapReduce-compatible inverted index builder.
//!
//! Every input line is a forward record `identifier,attribute,attribute,...`.
//! The map stage emits one `(attribute, identifier)` pair per attribute
//! occurrence; the reduce stage joins all identifiers for one attribute into
//! a comma-separated posting list.

use crate::*;
use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Separates the fields of an input record.
pub const FIELD_DELIMITER: char = ',';

/// Separates identifiers inside a posting list.
pub const POSTING_DELIMITER: u8 = b',';

#[derive(Parser, Debug, Serialize, Deserialize, PartialEq)]
#[clap(no_binary_name = true)]
struct Args {
    /// Separator between an attribute and its posting list in the output.
    /// `\t` and `\n` escapes are understood.
    #[clap(short, long, value_parser, default_value = "\\t")]
    separator: String,
}

impl Args {
    fn from_aux(aux: &[u8]) -> Result<Self> {
        let argv = if aux.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice::<Vec<String>>(aux)?
        };
        let mut args = Args::try_parse_from(argv)?;
        args.separator = utils::unescape(&args.separator);
        Ok(args)
    }
}

/// One `(attribute, identifier)` emission of the map stage.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PostingPair {
    pub attribute: String,
    pub identifier: String,
}

/// One line of the inverted index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRecord {
    pub attribute: String,
    pub posting_list: String,
}

/// Splits a record into its identifier and attribute tokens.
///
/// Returns [`None`] when the record carries no attribute. Empty tokens
/// between delimiters are kept verbatim, trailing empty tokens are dropped,
/// so `1,red,` has one attribute and `1,` has none.
fn split_record(line: &str) -> Option<(&str, Vec<&str>)> {
    let mut tokens: Vec<&str> = line.split(FIELD_DELIMITER).collect();
    while tokens.last().is_some_and(|t| t.is_empty()) {
        tokens.pop();
    }
    if tokens.len() < 2 {
        return None;
    }
    let identifier = tokens.remove(0);
    Some((identifier, tokens))
}

/// Expands one forward record into its posting pairs, in attribute order.
///
/// Lines without attributes yield nothing. No trimming or deduplication is
/// done: `id,a,a` yields `(a, id)` twice.
pub fn expand(line: &str) -> Vec<PostingPair> {
    let mut out = Vec::new();
    expand_into(line, &mut out);
    out
}

/// Like [`expand`], but writes into a caller-owned buffer.
///
/// The buffer is cleared first. Returns the number of pairs written.
pub fn expand_into(line: &str, out: &mut Vec<PostingPair>) -> usize {
    out.clear();
    if let Some((identifier, attributes)) = split_record(line) {
        out.extend(attributes.into_iter().map(|attribute| PostingPair {
            attribute: attribute.to_string(),
            identifier: identifier.to_string(),
        }));
    }
    out.len()
}

/// Joins all identifiers of one attribute into its posting list.
///
/// Identifiers are kept in the order they are yielded, duplicates included.
/// An empty sequence produces an empty posting list.
pub fn aggregate<I, S>(attribute: &str, identifiers: I) -> OutputRecord
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut posting_list = String::new();
    for (i, id) in identifiers.into_iter().enumerate() {
        if i > 0 {
            posting_list.push(POSTING_DELIMITER as char);
        }
        posting_list.push_str(id.as_ref());
    }
    OutputRecord {
        attribute: attribute.to_string(),
        posting_list,
    }
}

/// Like [`aggregate`], but streams the posting list into a caller-owned
/// buffer. The buffer is cleared first. Returns the number of identifiers.
pub fn aggregate_into<I, T>(identifiers: I, out: &mut BytesMut) -> usize
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    out.clear();
    append_posting_list(identifiers, out)
}

fn append_posting_list<I, T>(identifiers: I, out: &mut BytesMut) -> usize
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut count = 0;
    for id in identifiers {
        if count > 0 {
            out.put_u8(POSTING_DELIMITER);
        }
        out.put_slice(id.as_ref());
        count += 1;
    }
    count
}

/// Lazily walks the lines of one input file, yielding posting pairs.
struct Postings {
    source: String,
    text: String,
    pos: usize,
    line_no: usize,
    pending: VecDeque<KeyValue>,
}

impl Postings {
    /// Expands the next line into `pending`. Returns `false` at end of input.
    fn advance(&mut self) -> bool {
        if self.pos >= self.text.len() {
            return false;
        }
        let rest = &self.text[self.pos..];
        let (line, consumed) = match rest.find('\n') {
            Some(nl) => (&rest[..nl], nl + 1),
            None => (rest, rest.len()),
        };
        let line = line.strip_suffix('\r').unwrap_or(line);
        self.pos += consumed;
        self.line_no += 1;

        match split_record(line) {
            Some((identifier, attributes)) => {
                let identifier = Bytes::copy_from_slice(identifier.as_bytes());
                for attribute in attributes {
                    trace!(attribute, id = ?identifier, "Mapped");
                    self.pending.push_back(KeyValue::new(
                        Bytes::copy_from_slice(attribute.as_bytes()),
                        identifier.clone(),
                    ));
                }
            }
            None => {
                warn!(
                    file = %self.source,
                    line = self.line_no,
                    "Skipping line due to insufficient values: {:?}",
                    line
                );
            }
        }
        true
    }
}

impl Iterator for Postings {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(kv) = self.pending.pop_front() {
                return Some(Ok(kv));
            }
            if !self.advance() {
                return None;
            }
        }
    }
}

/// Parses the job's arguments (`--separator`) once. The resulting `aux` is
/// the unescaped separator itself, ready for [`reduce`].
pub fn prepare_args(aux: Bytes) -> Result<Bytes> {
    let args = Args::from_aux(&aux)?;
    Ok(utils::string_to_bytes(args.separator))
}

/// Map function: `kv` is `(file name, file contents)`.
pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    let source = String::from_utf8_lossy(&kv.key).into_owned();
    let (text, had_errors) = utils::decode_utf8_lossy(&kv.value);
    if had_errors {
        warn!(file = %source, "Input is not valid UTF-8, malformed sequences replaced");
    }

    Ok(Box::new(Postings {
        source,
        text: text.into_owned(),
        pos: 0,
        line_no: 0,
        pending: VecDeque::new(),
    }))
}

/// Reduce function: renders `attribute <separator> id,id,...\n`, where the
/// separator is the `aux` built by [`prepare_args`].
pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    separator: Bytes,
) -> Result<Bytes> {
    let mut writer = BytesMut::with_capacity(key.len() + separator.len() + 16);
    writer.put(key.as_ref());
    writer.put(separator.as_ref());
    let count = append_posting_list(values, &mut writer);
    writer.put_u8(b'\n');

    trace!(key = %String::from_utf8_lossy(&key), ids = count, "Reduced");
    Ok(writer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aux(args: &[&str]) -> Bytes {
        Bytes::from(serde_json::to_string(args).unwrap())
    }

    fn run_map(content: &str) -> Vec<(String, String)> {
        let kv = KeyValue::new(Bytes::from("input.txt"), Bytes::from(content.to_string()));
        map(kv, Bytes::new())
            .unwrap()
            .map(|item| {
                let kv = item.unwrap();
                (
                    utils::string_from_bytes(kv.key).unwrap(),
                    utils::string_from_bytes(kv.value).unwrap(),
                )
            })
            .collect()
    }

    fn pair(attribute: &str, identifier: &str) -> PostingPair {
        PostingPair {
            attribute: attribute.to_string(),
            identifier: identifier.to_string(),
        }
    }

    #[test]
    fn expand_emits_one_pair_per_attribute() {
        assert_eq!(
            expand("id,a,b,c"),
            vec![pair("a", "id"), pair("b", "id"), pair("c", "id")]
        );
    }

    #[test]
    fn expand_skips_records_without_attributes() {
        assert!(expand("").is_empty());
        assert!(expand("badline").is_empty());
        assert!(expand("1,").is_empty());
        assert!(expand(",,,").is_empty());
    }

    #[test]
    fn expand_keeps_tokens_verbatim() {
        assert_eq!(expand("1, red"), vec![pair(" red", "1")]);
        assert_eq!(expand("1,,red"), vec![pair("", "1"), pair("red", "1")]);
        assert_eq!(expand("1,red,,"), vec![pair("red", "1")]);
        assert_eq!(expand(",red"), vec![pair("red", "")]);
    }

    #[test]
    fn expand_preserves_duplicates() {
        assert_eq!(expand("id,a,a"), vec![pair("a", "id"), pair("a", "id")]);
    }

    #[test]
    fn expand_is_repeatable() {
        assert_eq!(expand("7,x,y"), expand("7,x,y"));
    }

    #[test]
    fn expand_into_clears_stale_pairs() {
        let mut buf = Vec::new();
        assert_eq!(expand_into("1,red,blue", &mut buf), 2);
        assert_eq!(expand_into("badline", &mut buf), 0);
        assert!(buf.is_empty());
        assert_eq!(expand_into("2,green", &mut buf), 1);
        assert_eq!(buf, vec![pair("green", "2")]);
    }

    #[test]
    fn aggregate_joins_in_delivery_order() {
        let out = aggregate("red", ["2", "1", "2"]);
        assert_eq!(out.attribute, "red");
        assert_eq!(out.posting_list, "2,1,2");
    }

    #[test]
    fn aggregate_is_repeatable() {
        let ids = ["3", "1", "3", "2"];
        let first = aggregate("a", ids);
        assert_eq!(first, aggregate("a", ids));
        assert_eq!(first.posting_list, "3,1,3,2");

        let mut buf = BytesMut::new();
        aggregate_into(ids, &mut buf);
        let once = buf.clone();
        aggregate_into(ids, &mut buf);
        assert_eq!(buf, once);
    }

    #[test]
    fn aggregate_of_nothing_is_empty() {
        let out = aggregate("ghost", Vec::<String>::new());
        assert_eq!(out.posting_list, "");
    }

    #[test]
    fn aggregate_delimiter_count() {
        let ids: Vec<String> = (0..1000).map(|i| i.to_string()).collect();
        let out = aggregate("hot", &ids);
        assert!(!out.posting_list.starts_with(','));
        assert!(!out.posting_list.ends_with(','));
        assert_eq!(out.posting_list.matches(',').count(), ids.len() - 1);
    }

    #[test]
    fn aggregate_into_resets_buffer() {
        let mut buf = BytesMut::new();
        assert_eq!(aggregate_into(["a", "b"], &mut buf), 2);
        assert_eq!(&buf[..], b"a,b");
        assert_eq!(aggregate_into(["c"], &mut buf), 1);
        assert_eq!(&buf[..], b"c");
        assert_eq!(aggregate_into(Vec::<&[u8]>::new(), &mut buf), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn map_emits_attribute_keyed_pairs() {
        let pairs = run_map("1,red,blue\nbadline\n2,red,green\n");
        assert_eq!(
            pairs,
            vec![
                ("red".to_string(), "1".to_string()),
                ("blue".to_string(), "1".to_string()),
                ("red".to_string(), "2".to_string()),
                ("green".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn map_handles_crlf_and_missing_final_newline() {
        let pairs = run_map("1,a\r\n2,b");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn map_of_empty_file_is_empty() {
        assert!(run_map("").is_empty());
        assert!(run_map("\n\n").is_empty());
    }

    #[test]
    fn map_survives_invalid_utf8() {
        let kv = KeyValue::new(Bytes::from("bin"), Bytes::from_static(b"1,r\xFFd\n"));
        let pairs: Vec<KeyValue> = map(kv, Bytes::new())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].value, Bytes::from("1"));
    }

    #[test]
    fn prepare_args_defaults_to_tab() {
        assert_eq!(prepare_args(Bytes::new()).unwrap(), Bytes::from("\t"));
        assert_eq!(prepare_args(aux(&[])).unwrap(), Bytes::from("\t"));
        assert_eq!(prepare_args(aux(&["-s", "\\n"])).unwrap(), Bytes::from("\n"));
    }

    #[test]
    fn prepare_args_rejects_unknown_arguments() {
        assert!(prepare_args(aux(&["--bogus"])).is_err());
        assert!(prepare_args(aux(&["--separater", "|"])).is_err());
        assert!(prepare_args(Bytes::from("not json")).is_err());
    }

    #[test]
    fn reduce_renders_tab_separated_line() {
        let values = vec![Bytes::from("1"), Bytes::from("2")];
        let separator = prepare_args(Bytes::new()).unwrap();
        let out = reduce(Bytes::from("red"), Box::new(values.into_iter()), separator).unwrap();
        assert_eq!(out, Bytes::from("red\t1,2\n"));
    }

    #[test]
    fn reduce_honours_custom_separator() {
        let values = vec![Bytes::from("1")];
        let separator = prepare_args(aux(&["--separator", " => "])).unwrap();
        let out = reduce(Bytes::from("only"), Box::new(values.into_iter()), separator).unwrap();
        assert_eq!(out, Bytes::from("only => 1\n"));
    }

    #[test]
    fn reduce_preserves_duplicates() {
        let values = vec![Bytes::from("id"), Bytes::from("id")];
        let out = reduce(Bytes::from("a"), Box::new(values.into_iter()), Bytes::from("\t")).unwrap();
        assert_eq!(out, Bytes::from("a\tid,id\n"));
    }
}

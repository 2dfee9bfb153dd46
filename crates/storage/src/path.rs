use std::fmt;

use arbiter_ast::{Ref, Value, DATA_ROOT};

use crate::error::StorageError;

/// A slash-separated key path into the document tree. The empty path
/// addresses the whole tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StorePath(pub Vec<String>);

impl StorePath {
    pub fn new(segments: Vec<String>) -> Self {
        StorePath(segments)
    }

    /// Translate a ground, `data`-rooted reference into a store path.
    /// Scalar segments only; numbers must be integral.
    pub fn for_ref(reference: &Ref) -> Result<StorePath, StorageError> {
        if !reference.root_is(DATA_ROOT) {
            return Err(StorageError::InvalidPath {
                segment: reference
                    .first()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "<empty>".to_string()),
            });
        }
        let mut segments = Vec::with_capacity(reference.len() - 1);
        for term in &reference[1..] {
            match &term.value {
                Value::String(s) => segments.push(s.clone()),
                Value::Number(d) if d.is_integer() => segments.push(d.to_string()),
                Value::Bool(b) => segments.push(b.to_string()),
                other => {
                    return Err(StorageError::InvalidPath {
                        segment: other.to_string(),
                    })
                }
            }
        }
        Ok(StorePath(segments))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_ast::Term;

    #[test]
    fn refs_translate_to_paths() {
        let r = Ref::data(&["a", "b"]);
        assert_eq!(
            StorePath::for_ref(&r).unwrap(),
            StorePath::new(vec!["a".into(), "b".into()])
        );

        let numeric = Ref::new(vec![
            Term::var(DATA_ROOT),
            Term::string("xs"),
            Term::int(2),
        ]);
        assert_eq!(
            StorePath::for_ref(&numeric).unwrap(),
            StorePath::new(vec!["xs".into(), "2".into()])
        );
    }

    #[test]
    fn non_data_roots_and_composites_are_rejected() {
        assert!(StorePath::for_ref(&Ref::input(&["a"])).is_err());

        let composite = Ref::new(vec![
            Term::var(DATA_ROOT),
            Term::array(vec![Term::int(1)]),
        ]);
        assert!(StorePath::for_ref(&composite).is_err());
    }
}

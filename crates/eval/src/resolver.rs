//! Reference resolution against base and overlay documents.
//!
//! The resolver reads from the input term, the overlay data term, the
//! base cache, and storage, merging overlay values over base values.
//! References disabled by inlining control or named in the save set
//! resolve to an unknown-value error, which drives residualisation in
//! partial mode.

use arbiter_ast::{Ref, Term, Value, DATA_ROOT, FUNC_ARGS_ROOT, INPUT_ROOT, SYSTEM_DOCUMENT_KEY};
use arbiter_storage::StorePath;

use crate::errors::Error;
use crate::eval::{merge, Machine};

impl Machine<'_> {
    /// Resolve a (plugged) reference to its current value. `Ok(None)`
    /// means undefined; unknown-value errors are recoverable signals in
    /// partial mode.
    pub fn resolve(&mut self, reference: &Ref) -> Result<Option<Value>, Error> {
        if self.inlining.disabled(reference, true)
            || (self.partial
                && self.save_set.contains(
                    &self.binds,
                    &Term::reference(reference.clone()),
                    self.caller_bid,
                ))
        {
            return Err(Error::unknown_value(format!(
                "{} is unknown",
                reference
            )));
        }

        if reference.root_is(FUNC_ARGS_ROOT) {
            // args[i] names the i-th callsite argument
            if let Some((args, bid)) = self.index_args.clone() {
                if let Some(i) = reference.get(1).and_then(|t| t.value.as_index()) {
                    if i < args.len() {
                        let plugged =
                            self.binds.plug_namespaced(&args[i], bid, self.caller_bid);
                        return Ok(Some(plugged.value));
                    }
                }
            }
            return Err(Error::unknown_value(format!(
                "{} is unknown",
                reference
            )));
        }

        if reference.root_is(INPUT_ROOT) {
            return Ok(match &self.input {
                Some(input) => input.value.find(&reference[1..]),
                None => None,
            });
        }

        if reference.root_is(DATA_ROOT) {
            let overlay: Option<Value> = self
                .data
                .as_ref()
                .and_then(|d| d.value.find(&reference[1..]));

            // a `with` target shadows the base subtree entirely
            if self.targets.prefixed(reference) {
                return Ok(overlay);
            }

            if let Some(real) = self.base_cache.get(reference).cloned() {
                self.instr.incr(crate::cache::COUNTER_BASE_CACHE_HIT);
                return match overlay {
                    None => Ok(Some(real.value)),
                    Some(o) => merge(&o, &real.value)
                        .map(Some)
                        .ok_or_else(|| Error::merge_conflict(reference[0].location)),
                };
            }
            self.instr.incr(crate::cache::COUNTER_BASE_CACHE_MISS);
            return self.resolve_read_from_storage(reference, overlay);
        }

        Err(Error::internal(
            format!("illegal ref head: {}", reference),
            reference
                .first()
                .map(|t| t.location)
                .unwrap_or_default(),
        ))
    }

    fn resolve_read_from_storage(
        &mut self,
        reference: &Ref,
        overlay: Option<Value>,
    ) -> Result<Option<Value>, Error> {
        if reference.contains_non_scalar() {
            return Ok(overlay);
        }

        let path = match StorePath::for_ref(reference) {
            Ok(p) => p,
            Err(e) if e.is_not_found() => return Ok(overlay),
            Err(e) => {
                return Err(Error::type_err(
                    e.to_string(),
                    reference[0].location,
                ))
            }
        };

        let blob = match self.store.read(&self.txn, &path) {
            Ok(b) => b,
            Err(e) if e.is_not_found() => return Ok(overlay),
            Err(e) => {
                return Err(Error::internal(
                    format!("storage: {}", e),
                    reference[0].location,
                ))
            }
        };

        // the reserved system namespace is hidden from whole-root reads
        let blob = if path.is_root() {
            match blob {
                serde_json::Value::Object(mut fields) => {
                    fields.remove(SYSTEM_DOCUMENT_KEY);
                    serde_json::Value::Object(fields)
                }
                other => other,
            }
        } else {
            blob
        };

        let value = Value::from_json(&blob)
            .map_err(|msg| Error::type_err(msg, reference[0].location))?;
        self.base_cache
            .put(reference.clone(), Term::new(value.clone()));

        match overlay {
            None => Ok(Some(value)),
            Some(o) => merge(&o, &value)
                .map(Some)
                .ok_or_else(|| Error::merge_conflict(reference[0].location)),
        }
    }
}

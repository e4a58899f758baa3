//! Per-field cache slots for lazily loaded entity fields.

/// A field slot with two logical states: `Unknown` (never fetched) and
/// `Known` (holds the last value read from or written to the database).
///
/// Getters call [`Lazy::get_or_load`] so a field is queried at most
/// once per entity object; setters call [`Lazy::set`] after their
/// write-through update. A setter may instead call
/// [`Lazy::invalidate`] to force a re-fetch on the next read.
#[derive(Debug, Clone, Default)]
pub(crate) enum Lazy<T> {
    #[default]
    Unknown,
    Known(T),
}

impl<T: Clone> Lazy<T> {
    pub fn known(value: T) -> Self {
        Lazy::Known(value)
    }

    /// Returns the cached value, loading and caching it first if the
    /// slot is `Unknown`.
    pub fn get_or_load<E>(&mut self, load: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        if let Lazy::Known(value) = self {
            return Ok(value.clone());
        }
        let value = load()?;
        *self = Lazy::Known(value.clone());
        Ok(value)
    }

    pub fn set(&mut self, value: T) {
        *self = Lazy::Known(value);
    }

    pub fn invalidate(&mut self) {
        *self = Lazy::Unknown;
    }
}

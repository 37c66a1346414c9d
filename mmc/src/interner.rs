use string_interner::{DefaultBackend, DefaultSymbol, StringInterner};

/// Interned mangled name, e.g. `::main::a`.
#[derive(Eq, PartialEq, Hash, Copy, Clone, Debug)]
pub struct NameId(DefaultSymbol);

impl NameId {
    #[inline]
    pub fn to_usize(&self) -> usize {
        string_interner::Symbol::to_usize(self.0)
    }
}

pub struct Interner(StringInterner<DefaultBackend<DefaultSymbol>>);

impl Interner {
    #[inline]
    pub fn intern(&mut self, name: &str) -> NameId {
        NameId(self.0.get_or_intern(name))
    }

    /// Lookup without interning, so probing for an undeclared name does not grow the pool.
    #[inline]
    pub fn get(&self, name: &str) -> Option<NameId> {
        self.0.get(name).map(NameId)
    }

    pub fn new() -> Self {
        Interner(StringInterner::new())
    }

    #[inline]
    pub fn resolve(&self, s: &NameId) -> Option<&str> {
        self.0.resolve(s.0)
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_gives_back_existing_name() {
        let mut i = Interner::new();
        let s1 = i.intern("::main::a");
        let s2 = i.intern("::main::a");
        assert_eq!(s1, s2);
    }

    #[test]
    fn get_does_not_intern() {
        let mut i = Interner::new();
        assert_eq!(None, i.get("::x"));
        let s = i.intern("::x");
        assert_eq!(Some(s), i.get("::x"));
        assert_eq!(Some("::x"), i.resolve(&s));
    }
}

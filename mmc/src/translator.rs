use std::{collections::HashMap, io};

use tracing::trace;

use crate::{
    errors::{Result, TranslateError},
    expression::Expression,
    interner::{Interner, NameId},
    ir::{QuadArray, Taco},
    symtab::{Symbol, SymbolKind, SymbolRef, SymbolTable, TableId, Value, GLOBAL_TABLE},
    types::DataType,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ConstKey {
    Char(u8),
    Int(i32),
    Double(u64),
    Str(usize),
}

impl From<Value> for ConstKey {
    fn from(v: Value) -> Self {
        match v {
            Value::Char(c) => ConstKey::Char(c),
            Value::Int(i) => ConstKey::Int(i),
            Value::Double(d) => ConstKey::Double(d.to_bits()),
            Value::Str(s) => ConstKey::Str(s),
        }
    }
}

/// One compilation session: the symbol table forest, the active scope chain, the
/// mangled name registry and the quad array. A fresh one is made per input file.
pub struct Translator {
    pub file: String,
    /// Table of tables; a table's id is its index.
    pub tables: Vec<SymbolTable>,
    environment: Vec<TableId>,
    scope_prefix: String,
    names: Interner,
    registry: HashMap<NameId, SymbolRef>,
    pub quads: QuadArray,
    temporary_count: usize,
    /// Source text of every string literal, quotes included. Entry 0 is unused.
    pub string_table: Vec<String>,
    constant_pool: HashMap<(TableId, ConstKey), SymbolRef>,
    pub trace_tacos: bool,
}

impl Translator {
    pub fn new(file: &str) -> Self {
        Translator {
            file: file.to_string(),
            tables: vec![SymbolTable::new(
                GLOBAL_TABLE,
                "gST",
                GLOBAL_TABLE,
                "::".to_string(),
            )],
            environment: vec![GLOBAL_TABLE],
            scope_prefix: "::".to_string(),
            names: Interner::new(),
            registry: HashMap::new(),
            quads: QuadArray::new(),
            temporary_count: 0,
            string_table: vec![String::new()],
            constant_pool: HashMap::new(),
            trace_tacos: false,
        }
    }

    pub fn global_table(&self) -> &SymbolTable {
        &self.tables[GLOBAL_TABLE]
    }

    pub fn current_environment(&self) -> TableId {
        *self.environment.last().unwrap_or(&GLOBAL_TABLE)
    }

    pub fn current_table(&self) -> &SymbolTable {
        &self.tables[self.current_environment()]
    }

    pub fn scope_prefix(&self) -> &str {
        &self.scope_prefix
    }

    pub fn table(&self, id: TableId) -> &SymbolTable {
        &self.tables[id]
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut SymbolTable {
        &mut self.tables[id]
    }

    /// Opens a new scope nested in the current one and makes it current.
    pub fn new_environment(&mut self, name: &str) -> TableId {
        let id = self.tables.len();
        let parent = self.current_environment();
        self.scope_prefix.push_str(name);
        self.scope_prefix.push_str("::");
        self.tables
            .push(SymbolTable::new(id, name, parent, self.scope_prefix.clone()));
        self.environment.push(id);
        id
    }

    /// Re-enters a scope made earlier, e.g. a function whose prototype came first.
    pub fn push_environment(&mut self, id: TableId) {
        self.scope_prefix = self.tables[id].prefix.clone();
        self.environment.push(id);
    }

    pub fn pop_environment(&mut self) -> Result<()> {
        if self.environment.len() <= 1 {
            return Err(TranslateError::NoActiveScope);
        }
        self.environment.pop();
        self.scope_prefix = self.current_table().prefix.clone();
        Ok(())
    }

    /// Declares `id` in the current scope under its mangled name.
    pub fn create_symbol(&mut self, id: &str, ty: DataType, kind: SymbolKind) -> Result<SymbolRef> {
        self.create_symbol_in(self.current_environment(), id, ty, kind)
    }

    pub fn create_symbol_in(
        &mut self,
        table: TableId,
        id: &str,
        ty: DataType,
        kind: SymbolKind,
    ) -> Result<SymbolRef> {
        let full = format!("{}{}", self.tables[table].prefix, id);
        let name = self.names.intern(&full);
        if self.registry.contains_key(&name) {
            return Err(TranslateError::DuplicateSymbol(full));
        }
        let t = &mut self.tables[table];
        let r = SymbolRef {
            table,
            index: t.symbols.len(),
        };
        t.symbols.push(Symbol::new(full, ty, kind));
        if kind == SymbolKind::Param {
            t.params += 1;
        }
        self.registry.insert(name, r);
        Ok(r)
    }

    /// Exact lookup of a mangled name.
    pub fn lookup(&self, full: &str) -> Result<SymbolRef> {
        self.names
            .get(full)
            .and_then(|n| self.registry.get(&n))
            .copied()
            .ok_or_else(|| TranslateError::UndefinedSymbol(full.to_string()))
    }

    /// Finds a source identifier in the innermost active scope declaring it.
    pub fn resolve(&self, id: &str) -> Result<SymbolRef> {
        for env in self.environment.iter().rev() {
            let full = format!("{}{}", self.tables[*env].prefix, id);
            if let Ok(r) = self.lookup(&full) {
                return Ok(r);
            }
        }
        Err(TranslateError::UndefinedSymbol(id.to_string()))
    }

    pub fn gen_temp(&mut self, ty: DataType) -> Result<SymbolRef> {
        self.gen_temp_in(self.current_environment(), ty)
    }

    pub fn gen_temp_in(&mut self, table: TableId, ty: DataType) -> Result<SymbolRef> {
        let id = self.next_temporary_name();
        self.create_symbol_in(table, &id, ty, SymbolKind::Temp)
    }

    fn next_temporary_name(&mut self) -> String {
        self.temporary_count += 1;
        format!("#{}", self.temporary_count)
    }

    /// The pooled constant holding `value` in the current scope.
    pub fn gen_const(&mut self, value: Value) -> Result<SymbolRef> {
        let table = self.current_environment();
        let key = (table, ConstKey::from(value));
        if let Some(r) = self.constant_pool.get(&key) {
            return Ok(*r);
        }
        let id = self.next_temporary_name();
        let r = self.create_symbol_in(table, &id, value.data_type(), SymbolKind::Const)?;
        self.symbol_mut(r).value = Some(value);
        self.constant_pool.insert(key, r);
        Ok(r)
    }

    /// Stores a string literal (with its quotes) and returns its index.
    pub fn add_string(&mut self, literal: &str) -> usize {
        if let Some(idx) = self.string_table.iter().skip(1).position(|s| s == literal) {
            return idx + 1;
        }
        self.string_table.push(literal.to_string());
        self.string_table.len() - 1
    }

    pub fn symbol(&self, r: SymbolRef) -> &Symbol {
        &self.tables[r.table].symbols[r.index]
    }

    pub fn symbol_mut(&mut self, r: SymbolRef) -> &mut Symbol {
        &mut self.tables[r.table].symbols[r.index]
    }

    pub fn type_of(&self, r: SymbolRef) -> DataType {
        self.symbol(r).ty
    }

    /// The literal held by a constant symbol.
    pub fn const_value(&self, r: SymbolRef) -> Option<Value> {
        let s = self.symbol(r);
        match s.kind {
            SymbolKind::Const => s.value,
            _ => None,
        }
    }

    pub fn is_temporary(&self, r: SymbolRef) -> bool {
        self.symbol(r).kind == SymbolKind::Temp
    }

    pub fn emit(&mut self, taco: Taco) -> usize {
        let address = self.quads.push(taco);
        if self.trace_tacos {
            if let Some(t) = self.quads.get(address) {
                trace!(target: "mmc::tacos", "{:>5}: {}", address, t.debug_to_string(self));
            }
        }
        address
    }

    pub fn next_instruction(&self) -> usize {
        self.quads.next_instruction()
    }

    pub fn patch_back(&mut self, address: usize, target: usize) -> Result<()> {
        self.quads.patch_target(address, target)
    }

    pub fn patch_back_list(&mut self, addresses: &[usize], target: usize) -> Result<()> {
        self.quads.patch_targets(addresses, target)
    }

    pub fn is_simple_reference(&self, e: &Expression) -> bool {
        e.is_reference && e.symbol.is_some() && e.symbol == e.aux_symbol
    }

    pub fn is_pointer_reference(&self, e: &Expression) -> bool {
        match (e.is_reference, e.symbol, e.aux_symbol) {
            (true, Some(s), Some(a)) if s != a => self.type_of(a) == self.type_of(s).pointer_to(),
            _ => false,
        }
    }

    pub fn is_matrix_reference(&self, e: &Expression) -> bool {
        match (e.is_reference, e.symbol, e.aux_symbol) {
            (true, Some(s), Some(a)) if s != a => {
                self.type_of(s).is_matrix() && self.type_of(a).is_int()
            }
            _ => false,
        }
    }

    /// A whole matrix, as opposed to one of its elements.
    pub fn is_matrix_operand(&self, e: &Expression) -> bool {
        match e.symbol {
            Some(s) if !e.is_boolean => {
                self.type_of(s).is_matrix() && !self.is_matrix_reference(e)
            }
            _ => false,
        }
    }

    /// Table of the function `name`, if it was declared.
    pub fn function_table(&self, name: &str) -> Option<TableId> {
        self.lookup(&format!("::{}", name))
            .ok()
            .and_then(|r| self.symbol(r).child)
    }

    /// Writes the quads, every symbol table and the string table.
    pub fn emit_mic<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "Quads for {}", self.file)?;
        for (i, q) in self.quads.iter().enumerate() {
            writeln!(out, "{:>5}: {}", i, q.debug_to_string(self))?;
        }
        writeln!(out)?;
        for t in &self.tables {
            writeln!(out, "{}", t)?;
        }
        writeln!(out, "String table")?;
        for (i, s) in self.string_table.iter().enumerate().skip(1) {
            writeln!(out, "{:>5}: {}", i, s)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OpCode;
    use std::collections::HashSet;

    #[test]
    fn names_are_mangled_by_scope() {
        let mut mic = Translator::new("t.mm");
        let g = mic.create_symbol("a", DataType::INT, SymbolKind::Local).unwrap();
        let f = mic.new_environment("f");
        let l = mic.create_symbol("a", DataType::INT, SymbolKind::Local).unwrap();
        assert_eq!("::a", mic.symbol(g).id);
        assert_eq!("::f::a", mic.symbol(l).id);
        assert_eq!(f, l.table);
        assert_eq!(GLOBAL_TABLE, mic.table(f).parent);
        assert_eq!(l, mic.resolve("a").unwrap());
        mic.pop_environment().unwrap();
        assert_eq!(g, mic.resolve("a").unwrap());
        assert_eq!("::", mic.scope_prefix());
    }

    #[test]
    fn mangled_names_are_unique() {
        let mut mic = Translator::new("t.mm");
        let mut seen = HashSet::new();
        for f in ["f", "g"] {
            mic.new_environment(f);
            for v in ["a", "b"] {
                let r = mic.create_symbol(v, DataType::DOUBLE, SymbolKind::Local).unwrap();
                assert!(seen.insert(mic.symbol(r).id.clone()));
            }
            mic.pop_environment().unwrap();
        }
        assert_eq!(4, seen.len());
    }

    #[test]
    fn duplicate_in_same_scope_fails() {
        let mut mic = Translator::new("t.mm");
        mic.new_environment("main");
        mic.create_symbol("x", DataType::INT, SymbolKind::Local).unwrap();
        let err = mic.create_symbol("x", DataType::CHAR, SymbolKind::Local).unwrap_err();
        assert!(matches!(err, TranslateError::DuplicateSymbol(n) if n == "::main::x"));
    }

    #[test]
    fn resolve_reaches_globals_from_a_function() {
        let mut mic = Translator::new("t.mm");
        let g = mic.create_symbol("g", DataType::INT, SymbolKind::Local).unwrap();
        mic.new_environment("main");
        assert_eq!(g, mic.resolve("g").unwrap());
        assert!(matches!(
            mic.resolve("missing"),
            Err(TranslateError::UndefinedSymbol(_))
        ));
    }

    #[test]
    fn cannot_leave_global_scope() {
        let mut mic = Translator::new("t.mm");
        assert!(matches!(
            mic.pop_environment(),
            Err(TranslateError::NoActiveScope)
        ));
    }

    #[test]
    fn temporaries_never_collide() {
        let mut mic = Translator::new("t.mm");
        mic.new_environment("main");
        let declared: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|n| mic.create_symbol(n, DataType::INT, SymbolKind::Local).unwrap())
            .collect();
        let temps: Vec<_> = (0..10).map(|_| mic.gen_temp(DataType::INT).unwrap()).collect();
        for t in &temps {
            assert!(!declared.contains(t));
            assert!(mic.is_temporary(*t));
            assert!(mic.symbol(*t).short_name().starts_with('#'));
        }
        let unique: HashSet<_> = temps.iter().collect();
        assert_eq!(temps.len(), unique.len());
    }

    #[test]
    fn constants_are_pooled_per_scope() {
        let mut mic = Translator::new("t.mm");
        mic.new_environment("main");
        let a = mic.gen_const(Value::Double(2.5)).unwrap();
        let b = mic.gen_const(Value::Double(2.5)).unwrap();
        let c = mic.gen_const(Value::Int(2)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(Some(Value::Double(2.5)), mic.const_value(a));
        assert_eq!(SymbolKind::Const, mic.symbol(c).kind);
    }

    #[test]
    fn parameters_are_counted() {
        let mut mic = Translator::new("t.mm");
        let t = mic.new_environment("f");
        mic.create_symbol("#ret", DataType::INT, SymbolKind::RetVal).unwrap();
        mic.create_symbol("x", DataType::INT, SymbolKind::Param).unwrap();
        mic.create_symbol("y", DataType::DOUBLE, SymbolKind::Param).unwrap();
        mic.create_symbol("z", DataType::DOUBLE, SymbolKind::Local).unwrap();
        assert_eq!(2, mic.table(t).params);
        assert_eq!(
            vec!["::f::x", "::f::y"],
            mic.table(t).params().map(|s| s.id.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn emit_and_back_patch() {
        let mut mic = Translator::new("t.mm");
        mic.new_environment("main");
        let a = mic.create_symbol("a", DataType::INT, SymbolKind::Local).unwrap();
        let j = mic.emit(Taco::branch(OpCode::IfVal, a, None));
        let g = mic.emit(Taco::goto());
        let here = mic.next_instruction();
        mic.patch_back_list(&[j, g], here).unwrap();
        assert_eq!(Some(here), mic.quads.get(j).and_then(|t| t.target()));
        assert_eq!(Some(here), mic.quads.get(g).and_then(|t| t.target()));
    }

    #[test]
    fn expression_predicates() {
        let mut mic = Translator::new("t.mm");
        mic.new_environment("main");
        let m = mic.create_symbol("m", DataType::matrix(2, 2), SymbolKind::Local).unwrap();
        let p = mic
            .create_symbol("p", DataType::INT.pointer_to(), SymbolKind::Local)
            .unwrap();
        let off = mic.gen_temp(DataType::INT).unwrap();
        let pointee = mic.gen_temp(DataType::INT).unwrap();

        let simple = Expression::simple_reference(m);
        assert!(mic.is_simple_reference(&simple));
        assert!(mic.is_matrix_operand(&simple));
        assert!(!mic.is_matrix_reference(&simple));

        let elem = Expression::matrix_reference(m, off);
        assert!(mic.is_matrix_reference(&elem));
        assert!(!mic.is_matrix_operand(&elem));

        let deref = Expression::pointer_reference(pointee, p);
        assert!(mic.is_pointer_reference(&deref));
        assert!(!mic.is_simple_reference(&deref));
    }

    #[test]
    fn strings_are_interned_once() {
        let mut mic = Translator::new("t.mm");
        let a = mic.add_string("\"hi\"");
        let b = mic.add_string("\"hi\"");
        assert_eq!(a, b);
        assert_eq!(1, a);
    }
}

//! In-memory spaces served by the mock instance.
//!
//! Index `n` of a space matches on tuple field `n`; the primary index (0) is
//! unique, secondary indexes are not.

use rmpv::Value;

/// Error code for a duplicate primary key.
pub const ER_TUPLE_FOUND: u32 = 3;

/// Error code for an update on a field outside the tuple.
pub const ER_NO_SUCH_FIELD: u32 = 37;

/// A space with its metadata and rows.
#[derive(Debug, Clone)]
pub struct MockSpace {
    pub id: u32,
    pub name: String,
    pub engine: String,
    /// Index names by id.
    pub indexes: Vec<String>,
    /// `(name, type)` per field.
    pub format: Vec<(String, String)>,
    rows: Vec<Vec<Value>>,
}

impl MockSpace {
    /// Space with a single primary index.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        MockSpace {
            id,
            name: name.into(),
            engine: "memtx".to_string(),
            indexes: vec!["primary".to_string()],
            format: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn with_index(mut self, name: impl Into<String>) -> Self {
        self.indexes.push(name.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: impl Into<String>) -> Self {
        self.format.push((name.into(), field_type.into()));
        self
    }

    pub fn with_row(mut self, row: Vec<Value>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// `_vspace` row: `[id, owner, name, engine, field_count, flags, format]`.
    pub fn vspace_row(&self) -> Value {
        let format = self
            .format
            .iter()
            .map(|(name, field_type)| {
                Value::Map(vec![
                    (Value::from("name"), Value::from(name.as_str())),
                    (Value::from("type"), Value::from(field_type.as_str())),
                ])
            })
            .collect();
        Value::Array(vec![
            Value::from(self.id),
            Value::from(1),
            Value::from(self.name.as_str()),
            Value::from(self.engine.as_str()),
            Value::from(self.format.len() as u64),
            Value::Map(Vec::new()),
            Value::Array(format),
        ])
    }

    /// `_vindex` rows: `[space_id, index_id, name, type, opts, parts]`.
    pub fn vindex_rows(&self) -> Vec<Value> {
        self.indexes
            .iter()
            .enumerate()
            .map(|(id, name)| {
                Value::Array(vec![
                    Value::from(self.id),
                    Value::from(id as u64),
                    Value::from(name.as_str()),
                    Value::from("tree"),
                    Value::Map(vec![(Value::from("unique"), Value::from(id == 0))]),
                    Value::Array(vec![Value::Array(vec![Value::from(id as u64), Value::from("scalar")])]),
                ])
            })
            .collect()
    }

    pub fn has_index(&self, index: u32) -> bool {
        (index as usize) < self.indexes.len()
    }

    pub fn index_id(&self, name: &str) -> Option<u32> {
        self.indexes.iter().position(|index| index == name).map(|id| id as u32)
    }

    fn matches(row: &[Value], index: u32, key: &[Value]) -> bool {
        match key.first() {
            None => true,
            Some(key) => row.get(index as usize) == Some(key),
        }
    }

    pub fn select(&self, index: u32, key: &[Value], offset: usize, limit: usize) -> Vec<Value> {
        self.rows
            .iter()
            .filter(|row| Self::matches(row, index, key))
            .skip(offset)
            .take(limit)
            .map(|row| Value::Array(row.clone()))
            .collect()
    }

    fn position(&self, key: Option<&Value>) -> Option<usize> {
        let key = key?;
        self.rows.iter().position(|row| row.first() == Some(key))
    }

    pub fn insert(&mut self, tuple: Vec<Value>) -> Result<Value, (u32, String)> {
        if self.position(tuple.first()).is_some() {
            return Err((
                ER_TUPLE_FOUND,
                format!("Duplicate key exists in unique index \"primary\" in space \"{}\"", self.name),
            ));
        }
        self.rows.push(tuple.clone());
        Ok(Value::Array(tuple))
    }

    pub fn replace(&mut self, tuple: Vec<Value>) -> Value {
        match self.position(tuple.first()) {
            Some(pos) => self.rows[pos] = tuple.clone(),
            None => self.rows.push(tuple.clone()),
        }
        Value::Array(tuple)
    }

    pub fn delete(&mut self, index: u32, key: &[Value]) -> Option<Value> {
        let pos = self.rows.iter().position(|row| Self::matches(row, index, key))?;
        Some(Value::Array(self.rows.remove(pos)))
    }

    /// Applies `["=", field, value]` operations to the first matching row.
    pub fn update(&mut self, index: u32, key: &[Value], ops: &[Value]) -> Result<Option<Value>, (u32, String)> {
        let Some(pos) = self.rows.iter().position(|row| Self::matches(row, index, key)) else {
            return Ok(None);
        };
        apply_ops(&mut self.rows[pos], ops)?;
        Ok(Some(Value::Array(self.rows[pos].clone())))
    }

    pub fn upsert(&mut self, tuple: Vec<Value>, ops: &[Value]) -> Result<(), (u32, String)> {
        match self.position(tuple.first()) {
            Some(pos) => apply_ops(&mut self.rows[pos], ops),
            None => {
                self.rows.push(tuple);
                Ok(())
            }
        }
    }
}

fn apply_ops(row: &mut [Value], ops: &[Value]) -> Result<(), (u32, String)> {
    for op in ops {
        let Some([_, field, value]) = op.as_array().map(Vec::as_slice) else {
            continue;
        };
        let field = field.as_u64().unwrap_or(u64::MAX) as usize;
        match row.get_mut(field) {
            Some(slot) => *slot = value.clone(),
            None => return Err((ER_NO_SUCH_FIELD, format!("Field {} was not found in the tuple", field))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> MockSpace {
        MockSpace::new(512, "users")
            .with_index("by_name")
            .with_field("id", "unsigned")
            .with_field("name", "string")
            .with_row(vec![Value::from(1), Value::from("ann")])
            .with_row(vec![Value::from(2), Value::from("bob")])
    }

    #[test]
    fn select_by_secondary_index() {
        let space = users();
        let rows = space.select(1, &[Value::from("bob")], 0, usize::MAX);
        assert_eq!(rows, vec![Value::Array(vec![Value::from(2), Value::from("bob")])]);
        assert_eq!(space.select(0, &[], 1, 10).len(), 1);
    }

    #[test]
    fn insert_rejects_duplicate_primary_key() {
        let mut space = users();
        let err = space.insert(vec![Value::from(1), Value::from("dup")]).unwrap_err();
        assert_eq!(err.0, ER_TUPLE_FOUND);
    }

    #[test]
    fn update_assigns_fields() {
        let mut space = users();
        let ops = vec![Value::Array(vec![Value::from("="), Value::from(1), Value::from("cat")])];
        let updated = space.update(0, &[Value::from(2)], &ops).unwrap().unwrap();
        assert_eq!(updated, Value::Array(vec![Value::from(2), Value::from("cat")]));
    }

    #[test]
    fn system_rows_describe_space() {
        let space = users();
        let row = space.vspace_row();
        assert_eq!(row.as_array().unwrap()[2], Value::from("users"));
        assert_eq!(space.vindex_rows().len(), 2);
        assert_eq!(space.index_id("by_name"), Some(1));
    }
}

//! Optimistic Patch Helpers
//!
//! Small transforms for the common list and record shapes. Each returns
//! `None` when the current value has the wrong shape, which leaves the key
//! unpatched.

use serde_json::Value;

fn id_of(item: &Value) -> Option<&Value> {
    item.get("id")
}

/// Appends `item` to a list; a missing list starts empty.
pub fn append(current: Option<&Value>, item: Value) -> Option<Value> {
    let mut items = current.cloned().unwrap_or_else(|| Value::Array(Vec::new()));
    items.as_array_mut()?.push(item);
    Some(items)
}

/// Inserts `item` at the head of a list; a missing list starts empty.
pub fn prepend(current: Option<&Value>, item: Value) -> Option<Value> {
    let mut items = current.cloned().unwrap_or_else(|| Value::Array(Vec::new()));
    items.as_array_mut()?.insert(0, item);
    Some(items)
}

/// Shallow-merges `fields` into an object.
pub fn merge(current: Option<&Value>, fields: &Value) -> Option<Value> {
    let mut record = current?.clone();
    let target = record.as_object_mut()?;
    for (field, value) in fields.as_object()? {
        target.insert(field.clone(), value.clone());
    }
    Some(record)
}

/// Merges `fields` into the list element whose `id` equals `id`.
pub fn merge_by_id(current: Option<&Value>, id: &Value, fields: &Value) -> Option<Value> {
    let mut items = current?.clone();
    let item = items
        .as_array_mut()?
        .iter_mut()
        .find(|item| id_of(item) == Some(id))?;
    *item = merge(Some(&*item), fields)?;
    Some(items)
}

/// Replaces the element with the same `id` as `item`, or appends it.
pub fn upsert_by_id(current: Option<&Value>, item: Value) -> Option<Value> {
    let mut items = current.cloned().unwrap_or_else(|| Value::Array(Vec::new()));
    let list = items.as_array_mut()?;
    let existing = id_of(&item).and_then(|id| list.iter().position(|other| id_of(other) == Some(id)));
    match existing {
        Some(position) => list[position] = item,
        None => list.push(item),
    }
    Some(items)
}

/// Removes the element whose `id` equals `id`.
pub fn remove_by_id(current: Option<&Value>, id: &Value) -> Option<Value> {
    let mut items = current?.clone();
    items.as_array_mut()?.retain(|item| id_of(item) != Some(id));
    Some(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_prepend() {
        let list = json!([{"id": 1}]);
        assert_eq!(append(Some(&list), json!({"id": 2})), Some(json!([{"id": 1}, {"id": 2}])));
        assert_eq!(prepend(Some(&list), json!({"id": 0})), Some(json!([{"id": 0}, {"id": 1}])));
        assert_eq!(append(None, json!(1)), Some(json!([1])));
    }

    #[test]
    fn test_wrong_shape_declines() {
        assert_eq!(append(Some(&json!({"not": "a list"})), json!(1)), None);
        assert_eq!(merge(Some(&json!([1])), &json!({"a": 1})), None);
        assert_eq!(merge(None, &json!({"a": 1})), None);
    }

    #[test]
    fn test_merge_by_id() {
        let list = json!([{"id": "a", "title": "old"}, {"id": "b", "title": "keep"}]);
        assert_eq!(
            merge_by_id(Some(&list), &json!("a"), &json!({"title": "new"})),
            Some(json!([{"id": "a", "title": "new"}, {"id": "b", "title": "keep"}]))
        );
        assert_eq!(merge_by_id(Some(&list), &json!("zzz"), &json!({})), None);
    }

    #[test]
    fn test_upsert_and_remove() {
        let list = json!([{"id": "a", "n": 1}]);
        let replaced = upsert_by_id(Some(&list), json!({"id": "a", "n": 2}));
        assert_eq!(replaced, Some(json!([{"id": "a", "n": 2}])));

        let appended = upsert_by_id(Some(&list), json!({"id": "b"}));
        assert_eq!(appended, Some(json!([{"id": "a", "n": 1}, {"id": "b"}])));

        assert_eq!(remove_by_id(Some(&list), &json!("a")), Some(json!([])));
    }
}

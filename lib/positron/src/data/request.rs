//! Operation requests: which fields of the target an operation touches,
//! plus per-operation options (monitor pipelining, queue sizing).
//!
//! The textual form accepted here is `field(a,b.c)` with an optional
//! `record[option=value,...]` prefix; a bare field list and the empty
//! string (select everything) are also accepted. On the wire a request
//! travels as an ordinary structure so peers never see the text.

use crate::data::bitset::BitSet;
use crate::data::value::{Field, PVField, PVStructure, ScalarKind, Structure};
use indexmap::IndexMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Selected field paths; empty selects the whole structure.
    pub paths: Vec<Vec<String>>,
    /// Monitor flow control: updates stop when the window is exhausted
    /// until the client acknowledges.
    pub pipeline: bool,
    /// Monitor queue bound; 0 means the implementation default.
    pub queue_size: usize,
}

impl Request {
    /// Selects every field.
    pub fn all() -> Request {
        Request {
            paths: Vec::new(),
            pipeline: false,
            queue_size: 0,
        }
    }

    pub fn parse(text: &str) -> Result<Request, String> {
        let mut request = Request::all();
        let text = text.trim();
        if text.is_empty() {
            return Ok(request);
        }

        let mut rest = text;
        if let Some(options_start) = rest.strip_prefix("record[") {
            let end = options_start
                .find(']')
                .ok_or_else(|| "unterminated record options".to_owned())?;
            for option in options_start[..end].split(',') {
                let option = option.trim();
                if option.is_empty() {
                    continue;
                }
                let mut parts = option.splitn(2, '=');
                let key = parts.next().unwrap_or("").trim();
                let value = parts.next().unwrap_or("").trim();
                request.apply_option(key, value)?;
            }
            rest = &options_start[end + 1..];
        }

        let rest = rest.trim();
        let list = match rest.strip_prefix("field(") {
            Some(inner) => inner
                .strip_suffix(')')
                .ok_or_else(|| "unterminated field selection".to_owned())?,
            None => rest,
        };

        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let path: Vec<String> = part.split('.').map(|s| s.trim().to_owned()).collect();
            if path.iter().any(|segment| segment.is_empty()) {
                return Err(format!("malformed field path '{}'", part));
            }
            request.paths.push(path);
        }
        Ok(request)
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "pipeline" => self.pipeline = value.eq_ignore_ascii_case("true"),
            "queueSize" => {
                self.queue_size = value
                    .parse()
                    .map_err(|_| format!("bad queueSize '{}'", value))?
            }
            _ => (),
        }
        Ok(())
    }

    /// Builds the structured wire form.
    pub fn to_structure(&self) -> PVStructure {
        let mut top = Vec::new();

        if self.pipeline || self.queue_size > 0 {
            let mut options = Vec::new();
            if self.pipeline {
                options.push(("pipeline".to_owned(), Field::Scalar(ScalarKind::Str)));
            }
            if self.queue_size > 0 {
                options.push(("queueSize".to_owned(), Field::Scalar(ScalarKind::Str)));
            }
            let options_type = Structure::new("", options);
            top.push((
                "record".to_owned(),
                Field::Structure(Structure::new(
                    "",
                    vec![("_options".to_owned(), Field::Structure(options_type))],
                )),
            ));
        }

        top.push(("field".to_owned(), Field::Structure(selection_type(&self.paths))));

        let mut value = PVStructure::new_default(Structure::new("", top));
        if self.pipeline {
            set_option(&mut value, "pipeline", "true");
        }
        if self.queue_size > 0 {
            set_option(&mut value, "queueSize", &self.queue_size.to_string());
        }
        value
    }

    /// Recovers a request from its structured wire form. Absent or odd
    /// pieces degrade to select-all rather than failing the operation.
    pub fn from_structure(value: Option<&PVStructure>) -> Request {
        let mut request = Request::all();
        let value = match value {
            Some(value) => value,
            None => return request,
        };

        if let Some(PVField::Structure(record)) = value.get("record") {
            if let Some(PVField::Structure(options)) = record.get("_options") {
                if let Some(PVField::Str(text)) = options.get("pipeline") {
                    request.pipeline = text.eq_ignore_ascii_case("true");
                }
                if let Some(PVField::Str(text)) = options.get("queueSize") {
                    request.queue_size = text.parse().unwrap_or(0);
                }
            }
        }

        if let Some(PVField::Structure(selection)) = value.get("field") {
            let mut prefix = Vec::new();
            collect_paths(selection, &mut prefix, &mut request.paths);
        }
        request
    }
}

fn set_option(value: &mut PVStructure, name: &str, text: &str) {
    if let Some(record_index) = value.structure().index_of("record") {
        if let PVField::Structure(record) = value.field_mut(record_index) {
            if let Some(options_index) = record.structure().index_of("_options") {
                if let PVField::Structure(options) = record.field_mut(options_index) {
                    let _ = options.set(name, PVField::Str(text.to_owned()));
                }
            }
        }
    }
}

fn selection_type(paths: &[Vec<String>]) -> Arc<Structure> {
    #[derive(Default)]
    struct Node {
        children: IndexMap<String, Node>,
    }

    fn insert(node: &mut Node, path: &[String]) {
        if let Some((head, tail)) = path.split_first() {
            let child = node.children.entry(head.clone()).or_insert_with(Node::default);
            insert(child, tail);
        }
    }

    fn build(node: &Node) -> Arc<Structure> {
        let fields = node
            .children
            .iter()
            .map(|(name, child)| (name.clone(), Field::Structure(build(child))))
            .collect();
        Structure::new("", fields)
    }

    let mut root = Node::default();
    for path in paths {
        insert(&mut root, path);
    }
    build(&root)
}

fn collect_paths(selection: &PVStructure, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    for (index, (name, _)) in selection.structure().fields().iter().enumerate() {
        prefix.push(name.clone());
        match selection.field(index) {
            PVField::Structure(nested) if nested.len() > 0 => collect_paths(nested, prefix, out),
            _ => out.push(prefix.clone()),
        }
        prefix.pop();
    }
}

/// Computed mapping between a base structure and the sub-structure a
/// request selects. Copies move only the covered leaves and translate the
/// change bits between the two numbering schemes.
#[derive(Debug)]
pub struct Mapper {
    requested: Arc<Structure>,
    leaves: Vec<LeafMap>,
}

#[derive(Debug)]
struct LeafMap {
    base_path: Vec<usize>,
    requested_path: Vec<usize>,
    base_bit: usize,
    requested_bit: usize,
    /// Bits of the base ancestors of this leaf, bit 0 excluded.
    base_ancestors: Vec<usize>,
    requested_ancestors: Vec<usize>,
}

impl Mapper {
    pub fn compute(base: &Arc<Structure>, request: &Request) -> Result<Mapper, String> {
        if request.paths.is_empty() {
            let requested = base.clone();
            let mut leaves = Vec::new();
            enumerate_identity(base, &mut Vec::new(), 0, &mut Vec::new(), &mut leaves);
            return Ok(Mapper { requested, leaves });
        }

        for path in &request.paths {
            if base.resolve(path).is_none() {
                return Err(format!("field '{}' not found", path.join(".")));
            }
        }

        let selection = selection_type(&request.paths);
        let mut leaves = Vec::new();
        let requested = project(
            base,
            &selection,
            &mut Vec::new(),
            &mut Vec::new(),
            0,
            0,
            &mut Vec::new(),
            &mut Vec::new(),
            &mut leaves,
        )?;
        Ok(Mapper { requested, leaves })
    }

    #[inline]
    pub fn requested(&self) -> &Arc<Structure> {
        &self.requested
    }

    pub fn build_requested(&self) -> PVStructure {
        PVStructure::new_default(self.requested.clone())
    }

    /// Copies the covered leaves from the base value into a requested
    /// value, raising the corresponding requested bits.
    pub fn copy_base_to_requested(
        &self,
        base: &PVStructure,
        base_mask: &BitSet,
        requested: &mut PVStructure,
        requested_mask: &mut BitSet,
    ) {
        let all = base_mask.get(0);
        for leaf in &self.leaves {
            let covered =
                all || base_mask.get(leaf.base_bit) || leaf.base_ancestors.iter().any(|&bit| base_mask.get(bit));
            if covered {
                *requested.get_path_mut(&leaf.requested_path) = base.get_path(&leaf.base_path).clone();
                requested_mask.set(leaf.requested_bit);
            }
        }
    }

    /// Copies the covered leaves of a requested value back into the base
    /// value, raising the corresponding base bits.
    pub fn copy_requested_to_base(
        &self,
        requested: &PVStructure,
        requested_mask: &BitSet,
        base: &mut PVStructure,
        base_mask: &mut BitSet,
    ) {
        let all = requested_mask.get(0);
        for leaf in &self.leaves {
            let covered = all
                || requested_mask.get(leaf.requested_bit)
                || leaf.requested_ancestors.iter().any(|&bit| requested_mask.get(bit));
            if covered {
                *base.get_path_mut(&leaf.base_path) = requested.get_path(&leaf.requested_path).clone();
                base_mask.set(leaf.base_bit);
            }
        }
    }
}

fn enumerate_identity(
    structure: &Arc<Structure>,
    path: &mut Vec<usize>,
    base: usize,
    ancestors: &mut Vec<usize>,
    out: &mut Vec<LeafMap>,
) {
    for (index, (_, field)) in structure.fields().iter().enumerate() {
        let offset = base + structure.offset(index);
        path.push(index);
        match field {
            Field::Structure(nested) => {
                ancestors.push(offset);
                enumerate_identity(nested, path, offset, ancestors, out);
                ancestors.pop();
            }
            _ => out.push(LeafMap {
                base_path: path.clone(),
                requested_path: path.clone(),
                base_bit: offset,
                requested_bit: offset,
                base_ancestors: ancestors.clone(),
                requested_ancestors: ancestors.clone(),
            }),
        }
        path.pop();
    }
}

// Builds the requested structure by filtering `base` through `selection`
// while recording leaf mappings for both bit numbering schemes.
#[allow(clippy::too_many_arguments)]
fn project(
    base: &Arc<Structure>,
    selection: &Arc<Structure>,
    base_path: &mut Vec<usize>,
    requested_path: &mut Vec<usize>,
    base_offset: usize,
    _requested_offset: usize,
    base_ancestors: &mut Vec<usize>,
    requested_ancestors: &mut Vec<usize>,
    out: &mut Vec<LeafMap>,
) -> Result<Arc<Structure>, String> {
    struct Pending {
        name: String,
        field: Field,
    }

    let mut pending: Vec<Pending> = Vec::new();
    // First pass: shape only, so requested offsets are known up front.
    for (base_index, (name, field)) in base.fields().iter().enumerate() {
        let selected = match selection.field(name) {
            Some(Field::Structure(sub)) => sub,
            _ => continue,
        };
        let whole = selected.len() == 0;
        let shaped = if whole {
            field.clone()
        } else {
            match field {
                Field::Structure(nested) => {
                    Field::Structure(shape_only(nested, selected).map_err(|err| {
                        format!("{} (under '{}')", err, base.fields()[base_index].0)
                    })?)
                }
                _ => return Err(format!("field '{}' has no sub-fields", name)),
            }
        };
        pending.push(Pending {
            name: name.clone(),
            field: shaped,
        });
    }

    let requested = Structure::new(base.id(), pending.into_iter().map(|p| (p.name, p.field)).collect());

    // Second pass: walk both structures recording leaf maps.
    let mut requested_index = 0;
    for (base_index, (name, field)) in base.fields().iter().enumerate() {
        let selected = match selection.field(name) {
            Some(Field::Structure(sub)) => sub,
            _ => continue,
        };
        let whole = selected.len() == 0;
        let base_bit = base_offset + base.offset(base_index);
        let requested_bit = requested.offset(requested_index);

        base_path.push(base_index);
        requested_path.push(requested_index);
        match field {
            Field::Structure(nested) if !whole => {
                base_ancestors.push(base_bit);
                requested_ancestors.push(requested_bit);
                let nested_requested = match &requested.fields()[requested_index].1 {
                    Field::Structure(s) => s.clone(),
                    _ => unreachable!(),
                };
                map_selected(
                    nested,
                    selected,
                    &nested_requested,
                    base_path,
                    requested_path,
                    base_bit,
                    requested_bit,
                    base_ancestors,
                    requested_ancestors,
                    out,
                );
                base_ancestors.pop();
                requested_ancestors.pop();
            }
            Field::Structure(nested) => {
                // whole subtree selected: identity mapping below this node
                base_ancestors.push(base_bit);
                requested_ancestors.push(requested_bit);
                map_whole(
                    nested,
                    base_path,
                    requested_path,
                    base_bit,
                    requested_bit,
                    base_ancestors,
                    requested_ancestors,
                    out,
                );
                base_ancestors.pop();
                requested_ancestors.pop();
            }
            _ => out.push(LeafMap {
                base_path: base_path.clone(),
                requested_path: requested_path.clone(),
                base_bit,
                requested_bit,
                base_ancestors: base_ancestors.clone(),
                requested_ancestors: requested_ancestors.clone(),
            }),
        }
        base_path.pop();
        requested_path.pop();
        requested_index += 1;
    }

    Ok(requested)
}

fn shape_only(base: &Arc<Structure>, selection: &Arc<Structure>) -> Result<Arc<Structure>, String> {
    let mut fields = Vec::new();
    for (name, field) in base.fields() {
        let selected = match selection.field(name) {
            Some(Field::Structure(sub)) => sub,
            _ => continue,
        };
        let whole = selected.len() == 0;
        let shaped = if whole {
            field.clone()
        } else {
            match field {
                Field::Structure(nested) => Field::Structure(shape_only(nested, selected)?),
                _ => return Err(format!("field '{}' has no sub-fields", name)),
            }
        };
        fields.push((name.clone(), shaped));
    }
    for (name, _) in selection.fields() {
        if base.field(name).is_none() {
            return Err(format!("field '{}' not found", name));
        }
    }
    Ok(Structure::new(base.id(), fields))
}

#[allow(clippy::too_many_arguments)]
fn map_selected(
    base: &Arc<Structure>,
    selection: &Arc<Structure>,
    requested: &Arc<Structure>,
    base_path: &mut Vec<usize>,
    requested_path: &mut Vec<usize>,
    base_offset: usize,
    requested_offset: usize,
    base_ancestors: &mut Vec<usize>,
    requested_ancestors: &mut Vec<usize>,
    out: &mut Vec<LeafMap>,
) {
    let mut requested_index = 0;
    for (base_index, (name, field)) in base.fields().iter().enumerate() {
        let selected = match selection.field(name) {
            Some(Field::Structure(sub)) => sub,
            _ => continue,
        };
        let whole = selected.len() == 0;
        let base_bit = base_offset + base.offset(base_index);
        let requested_bit = requested_offset + requested.offset(requested_index);

        base_path.push(base_index);
        requested_path.push(requested_index);
        match field {
            Field::Structure(nested) if !whole => {
                let nested_requested = match &requested.fields()[requested_index].1 {
                    Field::Structure(s) => s.clone(),
                    _ => unreachable!(),
                };
                base_ancestors.push(base_bit);
                requested_ancestors.push(requested_bit);
                map_selected(
                    nested,
                    selected,
                    &nested_requested,
                    base_path,
                    requested_path,
                    base_bit,
                    requested_bit,
                    base_ancestors,
                    requested_ancestors,
                    out,
                );
                base_ancestors.pop();
                requested_ancestors.pop();
            }
            Field::Structure(nested) => {
                base_ancestors.push(base_bit);
                requested_ancestors.push(requested_bit);
                map_whole(
                    nested,
                    base_path,
                    requested_path,
                    base_bit,
                    requested_bit,
                    base_ancestors,
                    requested_ancestors,
                    out,
                );
                base_ancestors.pop();
                requested_ancestors.pop();
            }
            _ => out.push(LeafMap {
                base_path: base_path.clone(),
                requested_path: requested_path.clone(),
                base_bit,
                requested_bit,
                base_ancestors: base_ancestors.clone(),
                requested_ancestors: requested_ancestors.clone(),
            }),
        }
        base_path.pop();
        requested_path.pop();
        requested_index += 1;
    }
}

#[allow(clippy::too_many_arguments)]
fn map_whole(
    structure: &Arc<Structure>,
    base_path: &mut Vec<usize>,
    requested_path: &mut Vec<usize>,
    base_offset: usize,
    requested_offset: usize,
    base_ancestors: &mut Vec<usize>,
    requested_ancestors: &mut Vec<usize>,
    out: &mut Vec<LeafMap>,
) {
    for (index, (_, field)) in structure.fields().iter().enumerate() {
        let base_bit = base_offset + structure.offset(index);
        let requested_bit = requested_offset + structure.offset(index);
        base_path.push(index);
        requested_path.push(index);
        match field {
            Field::Structure(nested) => {
                base_ancestors.push(base_bit);
                requested_ancestors.push(requested_bit);
                map_whole(
                    nested,
                    base_path,
                    requested_path,
                    base_bit,
                    requested_bit,
                    base_ancestors,
                    requested_ancestors,
                    out,
                );
                base_ancestors.pop();
                requested_ancestors.pop();
            }
            _ => out.push(LeafMap {
                base_path: base_path.clone(),
                requested_path: requested_path.clone(),
                base_bit,
                requested_bit,
                base_ancestors: base_ancestors.clone(),
                requested_ancestors: requested_ancestors.clone(),
            }),
        }
        base_path.pop();
        requested_path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_type() -> Arc<Structure> {
        Structure::new(
            "test:rec",
            vec![
                ("value".to_owned(), Field::Scalar(ScalarKind::Int)),
                ("extra".to_owned(), Field::Scalar(ScalarKind::Str)),
                (
                    "alarm".to_owned(),
                    Field::Structure(Structure::new(
                        "",
                        vec![
                            ("severity".to_owned(), Field::Scalar(ScalarKind::Int)),
                            ("message".to_owned(), Field::Scalar(ScalarKind::Str)),
                        ],
                    )),
                ),
            ],
        )
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(Request::parse("").unwrap(), Request::all());
        assert_eq!(
            Request::parse("field(value)").unwrap().paths,
            vec![vec!["value".to_owned()]]
        );
        assert_eq!(
            Request::parse("value,alarm.severity").unwrap().paths,
            vec![
                vec!["value".to_owned()],
                vec!["alarm".to_owned(), "severity".to_owned()]
            ]
        );

        let parsed = Request::parse("record[pipeline=true,queueSize=4]field(value)").unwrap();
        assert!(parsed.pipeline);
        assert_eq!(parsed.queue_size, 4);
        assert_eq!(parsed.paths.len(), 1);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Request::parse("field(value").is_err());
        assert!(Request::parse("record[pipeline=true").is_err());
        assert!(Request::parse("field(a..b)").is_err());
    }

    #[test]
    fn test_structure_roundtrip() {
        let request = Request::parse("record[pipeline=true,queueSize=8]field(value,alarm.severity)").unwrap();
        let wire = request.to_structure();
        let decoded = Request::from_structure(Some(&wire));
        assert_eq!(decoded, request);

        assert_eq!(Request::from_structure(None), Request::all());
    }

    #[test]
    fn test_mapper_select_all() {
        let base = base_type();
        let mapper = Mapper::compute(&base, &Request::all()).unwrap();
        assert_eq!(mapper.requested(), &base);

        let mut value = PVStructure::new_default(base.clone());
        value.set("value", PVField::Int(5)).unwrap();

        let mut requested = mapper.build_requested();
        let mut changed = BitSet::new();
        mapper.copy_base_to_requested(&value, &BitSet::of(0), &mut requested, &mut changed);
        assert_eq!(requested.get("value").unwrap().as_int(), Some(5));
        assert!(!changed.is_empty());
    }

    #[test]
    fn test_mapper_subset() {
        let base = base_type();
        let request = Request::parse("field(value)").unwrap();
        let mapper = Mapper::compute(&base, &request).unwrap();

        assert_eq!(mapper.requested().len(), 1);
        assert_eq!(mapper.requested().bit_count(), 2);

        let mut value = PVStructure::new_default(base.clone());
        value.set("value", PVField::Int(42)).unwrap();
        value.set("extra", PVField::Str("invisible".to_owned())).unwrap();

        // only 'extra' changed: nothing maps through
        let mut requested = mapper.build_requested();
        let mut changed = BitSet::new();
        mapper.copy_base_to_requested(&value, &BitSet::of(2), &mut requested, &mut changed);
        assert!(changed.is_empty());

        // 'value' changed (bit 1)
        mapper.copy_base_to_requested(&value, &BitSet::of(1), &mut requested, &mut changed);
        assert_eq!(requested.get("value").unwrap().as_int(), Some(42));
        assert!(changed.get(1));
    }

    #[test]
    fn test_mapper_write_back() {
        let base = base_type();
        let request = Request::parse("field(value)").unwrap();
        let mapper = Mapper::compute(&base, &request).unwrap();

        let mut requested = mapper.build_requested();
        requested.set("value", PVField::Int(99)).unwrap();

        let mut target = PVStructure::new_default(base);
        let mut changed = BitSet::new();
        mapper.copy_requested_to_base(&requested, &BitSet::of(0), &mut target, &mut changed);
        assert_eq!(target.get("value").unwrap().as_int(), Some(99));
        assert!(changed.get(1));
        assert!(!changed.get(2));
    }

    #[test]
    fn test_mapper_nested_selection() {
        let base = base_type();
        let request = Request::parse("field(alarm.message)").unwrap();
        let mapper = Mapper::compute(&base, &request).unwrap();

        // requested: { alarm: { message } }
        assert_eq!(mapper.requested().len(), 1);
        let alarm = match mapper.requested().field("alarm") {
            Some(Field::Structure(s)) => s.clone(),
            _ => panic!("missing alarm"),
        };
        assert_eq!(alarm.len(), 1);

        let mut value = PVStructure::new_default(base.clone());
        if let PVField::Structure(alarm_value) = value.field_mut(2) {
            alarm_value.set("message", PVField::Str("LOLO".to_owned())).unwrap();
        }

        // base bit for alarm.message: alarm at offset 3, message at 3+2=5
        let mut requested = mapper.build_requested();
        let mut changed = BitSet::new();
        mapper.copy_base_to_requested(&value, &BitSet::of(5), &mut requested, &mut changed);
        let mapped = requested.get("alarm").unwrap().as_structure().unwrap();
        assert_eq!(mapped.get("message").unwrap().as_str(), Some("LOLO"));
    }

    #[test]
    fn test_mapper_whole_substructure_selection() {
        let base = base_type();
        let request = Request::parse("field(alarm)").unwrap();
        let mapper = Mapper::compute(&base, &request).unwrap();

        let mut value = PVStructure::new_default(base.clone());
        if let PVField::Structure(alarm_value) = value.field_mut(2) {
            alarm_value.set("severity", PVField::Int(3)).unwrap();
        }

        // raising the alarm structure bit (3) covers both leaves below it
        let mut requested = mapper.build_requested();
        let mut changed = BitSet::new();
        mapper.copy_base_to_requested(&value, &BitSet::of(3), &mut requested, &mut changed);
        let mapped = requested.get("alarm").unwrap().as_structure().unwrap();
        assert_eq!(mapped.get("severity").unwrap().as_int(), Some(3));
        assert_eq!(changed.cardinality(), 2);
    }

    #[test]
    fn test_mapper_unknown_field() {
        let base = base_type();
        let request = Request::parse("field(bogus)").unwrap();
        assert!(Mapper::compute(&base, &request).is_err());
    }
}

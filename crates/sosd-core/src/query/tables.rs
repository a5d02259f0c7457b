//! Relations visible to queries, materialized row by row from a snapshot.

use super::datum::Datum;
use crate::store::StoreSnapshot;
use crate::types::Guid;

const PUBS_COLUMNS: &[&str] = &[
    "row_id",
    "guid",
    "title",
    "process_id",
    "thread_id",
    "comm_rank",
    "node_id",
    "prog_name",
    "prog_ver",
    "meta_channel",
    "meta_nature",
    "meta_layer",
    "meta_pri_hint",
    "meta_scope_hint",
    "meta_retain_hint",
    "pragma",
    "max_frame",
];

const DATA_COLUMNS: &[&str] = &[
    "row_id",
    "pub_guid",
    "guid",
    "name",
    "val_type",
    "meta_semantic",
];

const VALS_COLUMNS: &[&str] = &[
    "row_id",
    "guid",
    "val",
    "frame",
    "meta_semantic",
    "time_pack",
    "time_send",
    "time_recv",
];

const COMBINED_COLUMNS: &[&str] = &[
    "pub_guid",
    "guid",
    "title",
    "comm_rank",
    "process_id",
    "thread_id",
    "node_id",
    "prog_name",
    "prog_ver",
    "value_guid",
    "value_name",
    "value_type",
    "value",
    "frame",
    "meta_semantic",
    "time_pack",
    "time_send",
    "time_recv",
];

/// The queryable tables and the combined view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Pubs,
    Data,
    Vals,
    Combined,
}

pub type RowIter<'a> = Box<dyn Iterator<Item = Vec<Datum>> + 'a>;

impl Relation {
    pub const ALL: [Relation; 4] = [
        Relation::Pubs,
        Relation::Data,
        Relation::Vals,
        Relation::Combined,
    ];

    /// Case-insensitive lookup by table name.
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        match self {
            Relation::Pubs => "tblPubs",
            Relation::Data => "tblData",
            Relation::Vals => "tblVals",
            Relation::Combined => "viewCombined",
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Relation::Pubs => PUBS_COLUMNS,
            Relation::Data => DATA_COLUMNS,
            Relation::Vals => VALS_COLUMNS,
            Relation::Combined => COMBINED_COLUMNS,
        }
    }

    /// Position of a column, case-insensitive. `rowid` aliases `row_id`.
    pub fn column_index(self, name: &str) -> Option<usize> {
        let cols = self.columns();
        cols.iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .or_else(|| {
                if name.eq_ignore_ascii_case("rowid") {
                    cols.iter().position(|c| *c == "row_id")
                } else {
                    None
                }
            })
    }

    pub fn rows<'a>(self, snap: &'a StoreSnapshot) -> RowIter<'a> {
        match self {
            Relation::Pubs => Box::new(snap.pubs().iter().map(|p| {
                let info = &p.info;
                let meta = &info.meta;
                vec![
                    Datum::Int(p.row_id as i64),
                    guid(p.guid),
                    Datum::Text(info.title.clone()),
                    Datum::Int(info.process_id),
                    Datum::Int(info.thread_id),
                    Datum::Int(info.comm_rank),
                    Datum::Text(info.node_id.clone()),
                    Datum::Text(info.prog_name.clone()),
                    Datum::Text(info.prog_ver.clone()),
                    Datum::Int(i64::from(meta.channel)),
                    Datum::Int(meta.nature as i64),
                    Datum::Int(meta.layer as i64),
                    Datum::Int(meta.pri_hint as i64),
                    Datum::Int(meta.scope_hint as i64),
                    Datum::Int(meta.retain_hint as i64),
                    Datum::Text(info.pragma.clone()),
                    p.max_frame.map_or(Datum::Null, Datum::Int),
                ]
            })),
            Relation::Data => Box::new(snap.fields().iter().map(|f| {
                vec![
                    Datum::Int(f.row_id as i64),
                    guid(f.pub_guid),
                    guid(f.guid),
                    Datum::Text(f.name.clone()),
                    Datum::Int(i64::from(f.val_type.code())),
                    Datum::Int(f.semantic.code()),
                ]
            })),
            Relation::Vals => Box::new(snap.vals().iter().map(|v| {
                vec![
                    Datum::Int(v.row_id as i64),
                    guid(v.field_guid),
                    Datum::from(&v.value),
                    Datum::Int(v.frame),
                    Datum::Int(v.semantic.code()),
                    Datum::Real(v.time_pack),
                    Datum::Real(v.time_send),
                    Datum::Real(v.time_recv),
                ]
            })),
            Relation::Combined => Box::new(snap.vals().iter().map(move |v| {
                let p = snap.pub_of(v);
                let f = snap.field_of(v);
                let info = &p.info;
                vec![
                    guid(p.guid),
                    guid(p.guid),
                    Datum::Text(info.title.clone()),
                    Datum::Int(info.comm_rank),
                    Datum::Int(info.process_id),
                    Datum::Int(info.thread_id),
                    Datum::Text(info.node_id.clone()),
                    Datum::Text(info.prog_name.clone()),
                    Datum::Text(info.prog_ver.clone()),
                    guid(f.guid),
                    Datum::Text(f.name.clone()),
                    Datum::Int(i64::from(f.val_type.code())),
                    Datum::from(&v.value),
                    Datum::Int(v.frame),
                    Datum::Int(v.semantic.code()),
                    Datum::Real(v.time_pack),
                    Datum::Real(v.time_send),
                    Datum::Real(v.time_recv),
                ]
            })),
        }
    }
}

fn guid(g: Guid) -> Datum {
    Datum::Int(g as i64)
}

//! Query blocks and the mutable FROM-tree the flattener rewrites.
//!
//! The table tree is an arena of nodes with explicit parent links plus
//! two linearizations, the leaves chain and the locals chain. A rewrite
//! may leave the tree temporarily inconsistent; `fix_chains` restores
//! both linearizations from the tree structure.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use blockjoin_core::schema::TableSchema;
use blockjoin_core::storage::{Handler, MemTable};

use crate::bitmap::TableMap;
use crate::expr::Expr;

/// The planner's view of the base tables. Catalog ids double as the
/// executor's table indices.
#[derive(Default)]
pub struct Catalog {
    pub tables: Vec<CatalogTable>,
}

pub struct CatalogTable {
    pub name: String,
    pub store: Rc<RefCell<MemTable>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, store: Rc<RefCell<MemTable>>) -> usize {
        let name = store.borrow().schema().name.clone();
        self.tables.push(CatalogTable { name, store });
        self.tables.len() - 1
    }

    pub fn schema(&self, id: usize) -> Rc<TableSchema> {
        self.tables[id].store.borrow().schema().clone()
    }

    pub fn store(&self, id: usize) -> Rc<RefCell<MemTable>> {
        self.tables[id].store.clone()
    }

    pub fn row_count(&self, id: usize) -> f64 {
        self.tables[id].store.borrow().row_count() as f64
    }
}

pub type NodeId = usize;

/// Semi-join nest bookkeeping recorded by the flattener. Tables are
/// kept as catalog ids so the masks survive bitmap renumbering; the
/// planner derives `TableMap`s through the query block.
#[derive(Debug, Clone, Default)]
pub struct SjNestInfo {
    /// Inner tables of the nest
    pub inner_tables: BTreeSet<usize>,
    /// Outer tables the subquery was correlated with
    pub corr_tables: BTreeSet<usize>,
    /// All tables the nest's equalities and IN operands refer to
    pub depends_on: BTreeSet<usize>,
    /// Number of IN operands
    pub sj_in_exprs: usize,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Leaf {
        catalog: usize,
    },
    Nest {
        children: Vec<NodeId>,
        sj: Option<SjNestInfo>,
    },
}

/// One node of the FROM tree.
#[derive(Debug, Clone)]
pub struct TableNode {
    pub kind: NodeKind,
    /// Embedding nest
    pub parent: Option<NodeId>,
    pub alias: String,
    pub on_expr: Option<Expr>,
    /// The node is the inner side of an outer join
    pub outer_join: bool,
}

/// One SELECT block: a FROM tree, a WHERE clause and a select list.
#[derive(Debug, Clone, Default)]
pub struct QueryBlock {
    pub nodes: Vec<TableNode>,
    /// Children of the (implicit) tree root, in syntactic order
    pub top_list: Vec<NodeId>,
    pub where_clause: Option<Expr>,
    pub select: Vec<Expr>,
    /// Leaves linearization; a leaf's position here is its bitmap bit
    pub leaves: Vec<NodeId>,
    /// Locals linearization of the FROM list
    pub locals: Vec<NodeId>,
    pub straight_join: bool,
    pub has_group_by: bool,
    pub has_order_by: bool,
    pub has_having: bool,
    pub has_aggregates: bool,
    /// A prior optimization committed to another execution method
    pub exec_method_fixed: bool,
}

impl QueryBlock {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_node(&mut self, node: TableNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Adds a plain table to the FROM list.
    pub fn add_table(&mut self, catalog: usize, alias: &str) -> NodeId {
        let id = self.push_node(TableNode {
            kind: NodeKind::Leaf { catalog },
            parent: None,
            alias: alias.to_string(),
            on_expr: None,
            outer_join: false,
        });
        self.top_list.push(id);
        self.fix_chains();
        id
    }

    /// Adds a left-joined table with its ON expression.
    pub fn add_left_join(&mut self, catalog: usize, alias: &str, on: Expr) -> NodeId {
        let id = self.push_node(TableNode {
            kind: NodeKind::Leaf { catalog },
            parent: None,
            alias: alias.to_string(),
            on_expr: Some(on),
            outer_join: true,
        });
        self.top_list.push(id);
        self.fix_chains();
        id
    }

    /// Allocates an empty nest node; the caller wires it into the tree.
    pub fn alloc_join_nest(&mut self, alias: &str) -> NodeId {
        self.push_node(TableNode {
            kind: NodeKind::Nest {
                children: Vec::new(),
                sj: None,
            },
            parent: None,
            alias: alias.to_string(),
            on_expr: None,
            outer_join: false,
        })
    }

    /// Rebuilds the leaves and locals linearizations and the parent
    /// links from the tree structure. Rewrites call this after every
    /// structural change.
    pub fn fix_chains(&mut self) {
        let mut leaves = Vec::new();
        let order: Vec<NodeId> = self.top_list.clone();
        for id in &order {
            self.collect_leaves(*id, None, &mut leaves);
        }
        self.leaves = leaves;
        self.locals = self.leaves.clone();
    }

    fn collect_leaves(
        &mut self,
        id: NodeId,
        parent: Option<NodeId>,
        out: &mut Vec<NodeId>,
    ) {
        self.nodes[id].parent = parent;
        match self.nodes[id].kind.clone() {
            NodeKind::Leaf { .. } => out.push(id),
            NodeKind::Nest { children, .. } => {
                for child in children {
                    self.collect_leaves(child, Some(id), out);
                }
            }
        }
    }

    pub fn table_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn leaf_catalog(&self, leaf_pos: usize) -> usize {
        match self.nodes[self.leaves[leaf_pos]].kind {
            NodeKind::Leaf { catalog } => catalog,
            _ => unreachable!("leaves chain holds only leaf nodes"),
        }
    }

    /// Leaf position (bitmap bit) of a catalog table in this block.
    pub fn leaf_position(&self, catalog: usize) -> Option<usize> {
        (0..self.leaves.len()).find(|&p| self.leaf_catalog(p) == catalog)
    }

    /// Bitmap of the given catalog tables; tables of other blocks are
    /// ignored.
    pub fn map_of(&self, catalogs: &BTreeSet<usize>) -> TableMap {
        let mut map = TableMap::EMPTY;
        for &c in catalogs {
            if let Some(p) = self.leaf_position(c) {
                map |= TableMap::bit(p);
            }
        }
        map
    }

    /// Catalog tables referenced by this block that are not among its
    /// own leaves: the block's correlation set.
    pub fn outer_references(&self) -> BTreeSet<usize> {
        let own: BTreeSet<usize> = (0..self.leaves.len())
            .map(|p| self.leaf_catalog(p))
            .collect();
        let mut refs = BTreeSet::new();
        if let Some(w) = &self.where_clause {
            w.referenced_tables(&mut refs);
        }
        for s in &self.select {
            s.referenced_tables(&mut refs);
        }
        for node in &self.nodes {
            if let Some(on) = &node.on_expr {
                on.referenced_tables(&mut refs);
            }
        }
        refs.retain(|t| !own.contains(t));
        refs
    }

    /// Semi-join nests in this block.
    pub fn sj_nests(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                matches!(&n.kind, NodeKind::Nest { sj: Some(_), .. })
            })
            .map(|(id, _)| id)
            .collect()
    }

    pub fn nest_sj_info(&self, id: NodeId) -> Option<&SjNestInfo> {
        match &self.nodes[id].kind {
            NodeKind::Nest { sj, .. } => sj.as_ref(),
            _ => None,
        }
    }

    pub fn nest_sj_info_mut(&mut self, id: NodeId) -> Option<&mut SjNestInfo> {
        match &mut self.nodes[id].kind {
            NodeKind::Nest { sj, .. } => sj.as_mut(),
            _ => None,
        }
    }

    /// Bitmap of a nest's inner tables under the current numbering.
    pub fn sj_inner_map(&self, nest: NodeId) -> TableMap {
        self.nest_sj_info(nest)
            .map(|i| self.map_of(&i.inner_tables))
            .unwrap_or(TableMap::EMPTY)
    }

    pub fn sj_corr_map(&self, nest: NodeId) -> TableMap {
        self.nest_sj_info(nest)
            .map(|i| self.map_of(&i.corr_tables))
            .unwrap_or(TableMap::EMPTY)
    }

    pub fn sj_depends_map(&self, nest: NodeId) -> TableMap {
        self.nest_sj_info(nest)
            .map(|i| self.map_of(&i.depends_on))
            .unwrap_or(TableMap::EMPTY)
    }

    /// The innermost semi-join nest a leaf belongs to, if any.
    pub fn emb_sj_nest(&self, leaf_pos: usize) -> Option<NodeId> {
        let mut cur = self.nodes[self.leaves[leaf_pos]].parent;
        while let Some(id) = cur {
            if self.nest_sj_info(id).is_some() {
                return Some(id);
            }
            cur = self.nodes[id].parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockjoin_core::schema::{Column, ColumnType};
    use ntest::timeout;

    fn catalog_with(names: &[&str]) -> Catalog {
        let mut catalog = Catalog::new();
        for name in names {
            let schema = TableSchema::new(
                name,
                vec![Column::new("a", ColumnType::BigInt, false)],
            )
            .unwrap();
            catalog.add(Rc::new(RefCell::new(MemTable::new(schema))));
        }
        catalog
    }

    #[test]
    #[timeout(1000)]
    fn test_chains_follow_tree() {
        let catalog = catalog_with(&["t1", "t2"]);
        let _ = catalog;
        let mut query = QueryBlock::new();
        let n1 = query.add_table(0, "t1");
        let n2 = query.add_table(1, "t2");
        assert_eq!(query.leaves, vec![n1, n2]);
        assert_eq!(query.locals, vec![n1, n2]);
        assert_eq!(query.leaf_position(1), Some(1));
        assert_eq!(query.table_count(), 2);
    }

    #[test]
    #[timeout(1000)]
    fn test_nest_parent_links() {
        let mut query = QueryBlock::new();
        let t1 = query.add_table(0, "t1");
        let t2 = query.add_table(1, "t2");
        let nest = query.alloc_join_nest("(nest)");
        // Move t2 under the nest.
        query.top_list.retain(|&id| id != t2);
        match &mut query.nodes[nest].kind {
            NodeKind::Nest { children, .. } => children.push(t2),
            _ => unreachable!(),
        }
        query.top_list.push(nest);
        query.fix_chains();
        assert_eq!(query.nodes[t2].parent, Some(nest));
        assert_eq!(query.nodes[t1].parent, None);
        assert_eq!(query.leaves, vec![t1, t2]);
    }
}

//! Trust edges between principals and roles
//!
//! The graph is an explicit edge list. `resolve` walks it breadth-first from
//! the local principal exactly once and produces a [`TrustTable`], so the
//! broker never does recursive lookups at request time.

use super::RoleRef;
use std::collections::{HashMap, HashSet, VecDeque};

/// Who is allowed to assume a role
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    /// The identity the process starts with
    Local,
    Role(RoleRef),
}

/// `from` may assume `to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustEdge {
    pub from: Principal,
    pub to: RoleRef,
}

#[derive(Debug, Clone, Default)]
pub struct TrustGraph {
    edges: Vec<TrustEdge>,
}

impl TrustGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_edge(mut self, from: Principal, to: RoleRef) -> Self {
        self.edges.push(TrustEdge { from, to });
        self
    }

    pub fn edges(&self) -> &[TrustEdge] {
        &self.edges
    }

    /// Standard two-hop layout: local -> central role -> each source role.
    ///
    /// The central account is reachable in one hop. Only the central
    /// credential is ever presented to source accounts, never the local one.
    pub fn central_hub<'a>(
        central: RoleRef,
        source_accounts: impl IntoIterator<Item = &'a str>,
        source_role_name: &str,
    ) -> Self {
        let mut graph = Self::new().with_edge(Principal::Local, central.clone());
        for account in source_accounts {
            if account == central.account_id {
                continue;
            }
            graph = graph.with_edge(
                Principal::Role(central.clone()),
                RoleRef::new(account, source_role_name),
            );
        }
        graph
    }

    /// Shortest chain from the local principal to every reachable account.
    ///
    /// Cycles are ignored. When two chains of equal length reach the same
    /// account, the one whose edges were added first wins.
    pub fn resolve(&self) -> TrustTable {
        let mut adjacency: HashMap<&Principal, Vec<&RoleRef>> = HashMap::new();
        for edge in &self.edges {
            adjacency.entry(&edge.from).or_default().push(&edge.to);
        }

        let mut chains: HashMap<String, Vec<RoleRef>> = HashMap::new();
        let mut visited: HashSet<RoleRef> = HashSet::new();
        let mut queue: VecDeque<(Principal, Vec<RoleRef>)> = VecDeque::new();
        queue.push_back((Principal::Local, Vec::new()));

        while let Some((principal, chain)) = queue.pop_front() {
            let Some(targets) = adjacency.get(&principal) else {
                continue;
            };
            for role in targets {
                if !visited.insert((*role).clone()) {
                    continue;
                }
                let mut next = chain.clone();
                next.push((*role).clone());
                chains
                    .entry(role.account_id.clone())
                    .or_insert_with(|| next.clone());
                queue.push_back((Principal::Role((*role).clone()), next));
            }
        }

        TrustTable { chains }
    }
}

/// Account id -> ordered roles to assume, first hop first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustTable {
    chains: HashMap<String, Vec<RoleRef>>,
}

impl TrustTable {
    pub fn chain_for(&self, account_id: &str) -> Option<&[RoleRef]> {
        self.chains.get(account_id).map(Vec::as_slice)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CENTRAL: &str = "111111111111";
    const SOURCE_A: &str = "222222222222";
    const SOURCE_B: &str = "333333333333";

    fn central() -> RoleRef {
        RoleRef::new(CENTRAL, "CrossAccountS3Access")
    }

    #[test]
    fn test_central_hub_resolves_two_hops() {
        let table =
            TrustGraph::central_hub(central(), [SOURCE_A, SOURCE_B], "PostgresMetricsUploader")
                .resolve();

        assert_eq!(table.len(), 3);
        assert_eq!(table.chain_for(CENTRAL), Some(&[central()][..]));

        let chain = table.chain_for(SOURCE_A).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0], central());
        assert_eq!(chain[1], RoleRef::new(SOURCE_A, "PostgresMetricsUploader"));
    }

    #[test]
    fn test_unreachable_account_has_no_chain() {
        let table = TrustGraph::new()
            .with_edge(
                Principal::Role(RoleRef::new(SOURCE_A, "Orphan")),
                RoleRef::new(SOURCE_B, "Reader"),
            )
            .resolve();

        assert!(table.is_empty());
        assert_eq!(table.chain_for(SOURCE_B), None);
    }

    #[test]
    fn test_shortest_chain_wins_and_cycles_terminate() {
        let a = RoleRef::new(SOURCE_A, "Reader");
        let graph = TrustGraph::new()
            .with_edge(Principal::Local, central())
            .with_edge(Principal::Role(central()), a.clone())
            .with_edge(Principal::Role(a.clone()), central())
            .with_edge(Principal::Local, a.clone());

        let table = graph.resolve();
        assert_eq!(table.chain_for(SOURCE_A), Some(&[a][..]));
        assert_eq!(table.chain_for(CENTRAL).map(<[RoleRef]>::len), Some(1));
    }

    #[test]
    fn test_central_listed_as_source_stays_one_hop() {
        let table =
            TrustGraph::central_hub(central(), [CENTRAL, SOURCE_A], "PostgresMetricsUploader")
                .resolve();
        assert_eq!(table.chain_for(CENTRAL).map(<[RoleRef]>::len), Some(1));
    }
}

//! Certificate policy processing (RFC 5280 §6.1.2–6.1.5).
//!
//! The valid_policy_tree is kept as one vector of nodes per depth. Nodes are
//! never physically removed; deleting a node marks it dead, and descendants of
//! a dead node are dead too.

use crate::pkix::codec::Certificate;
use crate::types::oids::ANY_POLICY;

use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyViolation {
    /// explicit_policy reached zero with an empty tree.
    NoAcceptablePolicy,
    /// A policy mapping named anyPolicy.
    AnyPolicyMapping,
    /// The user-constrained set shares nothing with the required policies.
    RequiredPolicyMissing,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyViolation::NoAcceptablePolicy => f.write_str("no acceptable certificate policy"),
            PolicyViolation::AnyPolicyMapping => f.write_str("policy mapping references anyPolicy"),
            PolicyViolation::RequiredPolicyMissing => f.write_str("required certificate policy not asserted"),
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    valid_policy: String,
    expected_policy_set: BTreeSet<String>,
    parent: Option<usize>,
    alive: bool,
}

impl Node {
    fn root() -> Self {
        Self {
            valid_policy: ANY_POLICY.to_string(),
            expected_policy_set: BTreeSet::from([ANY_POLICY.to_string()]),
            parent: None,
            alive: true,
        }
    }

    fn child(policy: &str, parent: usize) -> Self {
        Self {
            valid_policy: policy.to_string(),
            expected_policy_set: BTreeSet::from([policy.to_string()]),
            parent: Some(parent),
            alive: true,
        }
    }
}

/// Initial inputs that the relying party controls.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyInputs {
    pub initial_explicit_policy: bool,
    pub initial_policy_mapping_inhibit: bool,
    pub initial_any_policy_inhibit: bool,
}

/// Stateful policy processor, fed one certificate at a time from the
/// certificate issued by the trust anchor down to the end entity.
#[derive(Debug)]
pub struct PolicyProcessor {
    levels: Vec<Vec<Node>>,
    path_len: usize,
    explicit_policy: usize,
    policy_mapping: usize,
    inhibit_any_policy: usize,
    processed: usize,
}

impl PolicyProcessor {
    pub fn new(path_len: usize, inputs: PolicyInputs) -> Self {
        let initial = |inhibit: bool| if inhibit { 0 } else { path_len + 1 };

        Self {
            levels: vec![vec![Node::root()]],
            path_len,
            explicit_policy: initial(inputs.initial_explicit_policy),
            policy_mapping: initial(inputs.initial_policy_mapping_inhibit),
            inhibit_any_policy: initial(inputs.initial_any_policy_inhibit),
            processed: 0,
        }
    }

    fn is_null(&self) -> bool {
        !self.levels[0][0].alive
    }

    fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    fn has_live_child(&self, depth: usize, index: usize) -> bool {
        self.levels
            .get(depth + 1)
            .map(|next| next.iter().any(|n| n.alive && n.parent == Some(index)))
            .unwrap_or(false)
    }

    /// Remove childless nodes above the deepest level.
    fn prune(&mut self) {
        let deepest = self.depth();
        for depth in (0..deepest).rev() {
            for index in 0..self.levels[depth].len() {
                if self.levels[depth][index].alive && !self.has_live_child(depth, index) {
                    self.levels[depth][index].alive = false;
                }
            }
        }
    }

    /// Propagate deletions from `depth` downwards.
    fn kill_descendants(&mut self, depth: usize) {
        for d in depth + 1..self.levels.len() {
            let (upper, lower) = self.levels.split_at_mut(d);
            let parents = &upper[d - 1];
            for node in lower[0].iter_mut() {
                if let Some(parent) = node.parent {
                    if !parents[parent].alive {
                        node.alive = false;
                    }
                }
            }
        }
    }

    fn live_nodes(&self, depth: usize) -> impl Iterator<Item = (usize, &Node)> {
        self.levels[depth].iter().enumerate().filter(|(_, n)| n.alive)
    }

    /// Process certificate `i` (1-based) of the path.
    pub fn process(&mut self, cert: &Certificate) -> Result<(), PolicyViolation> {
        self.processed += 1;
        let i = self.processed;
        let is_last = i == self.path_len;
        let ext = cert.extensions();

        match (&ext.certificate_policies, self.is_null()) {
            (Some(policies), false) => {
                let parent_depth = i - 1;
                let mut children: Vec<Node> = Vec::new();

                for policy in policies.iter().filter(|p| p.as_str() != ANY_POLICY) {
                    let matched: Vec<usize> = self
                        .live_nodes(parent_depth)
                        .filter(|(_, n)| n.expected_policy_set.contains(policy))
                        .map(|(idx, _)| idx)
                        .collect();

                    if matched.is_empty() {
                        for (idx, _) in self.live_nodes(parent_depth).filter(|(_, n)| n.valid_policy == ANY_POLICY) {
                            children.push(Node::child(policy, idx));
                        }
                    } else {
                        children.extend(matched.into_iter().map(|idx| Node::child(policy, idx)));
                    }
                }

                let asserts_any = policies.iter().any(|p| p == ANY_POLICY);
                if asserts_any && (self.inhibit_any_policy > 0 || (!is_last && cert.is_self_issued())) {
                    for (idx, node) in self.live_nodes(parent_depth) {
                        for expected in &node.expected_policy_set {
                            let exists = children
                                .iter()
                                .any(|c| c.parent == Some(idx) && &c.valid_policy == expected);
                            if !exists {
                                children.push(Node::child(expected, idx));
                            }
                        }
                    }
                }

                self.levels.push(children);
                self.prune();
            }
            _ => {
                // Absent certificatePolicies (or an already empty tree)
                // leaves the tree empty from here on.
                self.levels.push(Vec::new());
                self.levels[0][0].alive = false;
                self.kill_descendants(0);
            }
        }

        if self.explicit_policy == 0 && self.is_null() {
            return Err(PolicyViolation::NoAcceptablePolicy);
        }

        if !is_last {
            self.prepare_next(cert)?;
        }

        Ok(())
    }

    fn prepare_next(&mut self, cert: &Certificate) -> Result<(), PolicyViolation> {
        let ext = cert.extensions();
        let depth = self.depth();

        if ext
            .policy_mappings
            .iter()
            .any(|(issuer, subject)| issuer == ANY_POLICY || subject == ANY_POLICY)
        {
            return Err(PolicyViolation::AnyPolicyMapping);
        }

        let issuer_policies: BTreeSet<&String> = ext.policy_mappings.iter().map(|(issuer, _)| issuer).collect();

        for issuer_policy in issuer_policies {
            let mapped: BTreeSet<String> = ext
                .policy_mappings
                .iter()
                .filter(|(issuer, _)| issuer == issuer_policy)
                .map(|(_, subject)| subject.clone())
                .collect();

            if self.policy_mapping > 0 {
                let mut found = false;
                for node in self.levels[depth].iter_mut().filter(|n| n.alive) {
                    if &node.valid_policy == issuer_policy {
                        node.expected_policy_set = mapped.clone();
                        found = true;
                    }
                }

                if !found {
                    let any_parent = self
                        .live_nodes(depth)
                        .find(|(_, n)| n.valid_policy == ANY_POLICY)
                        .and_then(|(_, n)| n.parent);
                    if let Some(parent) = any_parent {
                        let mut node = Node::child(issuer_policy, parent);
                        node.expected_policy_set = mapped;
                        self.levels[depth].push(node);
                    }
                }
            } else {
                for node in self.levels[depth].iter_mut() {
                    if &node.valid_policy == issuer_policy {
                        node.alive = false;
                    }
                }
                self.prune();
            }
        }

        if !cert.is_self_issued() {
            self.explicit_policy = self.explicit_policy.saturating_sub(1);
            self.policy_mapping = self.policy_mapping.saturating_sub(1);
            self.inhibit_any_policy = self.inhibit_any_policy.saturating_sub(1);
        }

        if let Some(constraints) = ext.policy_constraints {
            if let Some(require) = constraints.require_explicit_policy {
                self.explicit_policy = self.explicit_policy.min(require as usize);
            }
            if let Some(inhibit) = constraints.inhibit_policy_mapping {
                self.policy_mapping = self.policy_mapping.min(inhibit as usize);
            }
        }

        if let Some(skip_certs) = ext.inhibit_any_policy {
            self.inhibit_any_policy = self.inhibit_any_policy.min(skip_certs as usize);
        }

        Ok(())
    }

    /// Wrap-up: intersect with the user-initial-policy-set and return the
    /// resulting set of valid policies at the leaf depth.
    pub fn finish(mut self, leaf: &Certificate, required: &[String]) -> Result<BTreeSet<String>, PolicyViolation> {
        self.explicit_policy = self.explicit_policy.saturating_sub(1);
        if let Some(constraints) = leaf.extensions().policy_constraints {
            if constraints.require_explicit_policy == Some(0) {
                self.explicit_policy = 0;
            }
        }

        let user_set: BTreeSet<&str> = required.iter().map(String::as_str).collect();
        let user_any = user_set.is_empty() || user_set.contains(ANY_POLICY);

        if !self.is_null() && !user_any {
            self.intersect(&user_set);
        }

        if self.explicit_policy == 0 && self.is_null() {
            return Err(PolicyViolation::NoAcceptablePolicy);
        }

        let depth = self.depth();
        let valid: BTreeSet<String> = if self.is_null() {
            BTreeSet::new()
        } else {
            self.live_nodes(depth).map(|(_, n)| n.valid_policy.clone()).collect()
        };

        if !user_any && valid.is_empty() {
            return Err(PolicyViolation::RequiredPolicyMissing);
        }

        Ok(valid)
    }

    fn intersect(&mut self, user_set: &BTreeSet<&str>) {
        let leaf_depth = self.depth();

        // valid_policy_node_set: nodes whose parent is an anyPolicy node
        let mut valid_policy_nodes: Vec<(usize, usize)> = Vec::new();
        for depth in 1..=leaf_depth {
            for (idx, node) in self.live_nodes(depth) {
                let parent_is_any = node
                    .parent
                    .map(|p| self.levels[depth - 1][p].valid_policy == ANY_POLICY)
                    .unwrap_or(false);
                if parent_is_any {
                    valid_policy_nodes.push((depth, idx));
                }
            }
        }

        let present: BTreeSet<String> = valid_policy_nodes
            .iter()
            .map(|&(d, i)| self.levels[d][i].valid_policy.clone())
            .collect();

        for &(depth, idx) in &valid_policy_nodes {
            let policy = self.levels[depth][idx].valid_policy.as_str();
            if policy != ANY_POLICY && !user_set.contains(policy) {
                self.levels[depth][idx].alive = false;
                self.kill_descendants(depth);
            }
        }

        let any_leaf = self
            .live_nodes(leaf_depth)
            .find(|(_, n)| n.valid_policy == ANY_POLICY)
            .map(|(idx, n)| (idx, n.parent));

        if let Some((any_idx, parent)) = any_leaf {
            if let Some(parent) = parent {
                for policy in user_set.iter().filter(|p| !present.contains(**p)) {
                    self.levels[leaf_depth].push(Node::child(policy, parent));
                }
            }
            self.levels[leaf_depth][any_idx].alive = false;
        }

        self.prune();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, IsCa};

    const POLICY_A: &str = "2.16.840.1.101.3.2.1.3.7";
    const POLICY_B: &str = "2.16.840.1.101.3.2.1.3.13";

    fn encode_oid(oid: &str) -> Vec<u8> {
        let arcs: Vec<u64> = oid.split('.').map(|a| a.parse().unwrap()).collect();
        let mut body = vec![(arcs[0] * 40 + arcs[1]) as u8];
        for &arc in &arcs[2..] {
            let mut chunk = vec![(arc & 0x7f) as u8];
            let mut rest = arc >> 7;
            while rest > 0 {
                chunk.insert(0, ((rest & 0x7f) as u8) | 0x80);
                rest >>= 7;
            }
            body.extend(chunk);
        }
        let mut out = vec![0x06, body.len() as u8];
        out.extend(body);
        out
    }

    fn sequence(items: Vec<Vec<u8>>) -> Vec<u8> {
        let body: Vec<u8> = items.concat();
        let mut out = vec![0x30, body.len() as u8];
        out.extend(body);
        out
    }

    fn cert_with_policies(cn: &str, ca: bool, policies: &[&str], extra: Vec<CustomExtension>) -> Certificate {
        let mut params = CertificateParams::new(vec![]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.is_ca = if ca { IsCa::Ca(rcgen::BasicConstraints::Unconstrained) } else { IsCa::NoCa };
        let value = sequence(policies.iter().map(|p| sequence(vec![encode_oid(p)])).collect());
        params.custom_extensions.push(CustomExtension::from_oid_content(&[2, 5, 29, 32], value));
        params.custom_extensions.extend(extra);
        let der = rcgen::Certificate::from_params(params).unwrap().serialize_der().unwrap();
        Certificate::from_der(&der).unwrap()
    }

    fn run(path: &[Certificate], inputs: PolicyInputs, required: &[&str]) -> Result<BTreeSet<String>, PolicyViolation> {
        let mut processor = PolicyProcessor::new(path.len(), inputs);
        for cert in path {
            processor.process(cert)?;
        }
        let required: Vec<String> = required.iter().map(|s| s.to_string()).collect();
        processor.finish(path.last().unwrap(), &required)
    }

    #[test]
    fn test_matching_policy_survives_intersection() {
        let path = vec![
            cert_with_policies("I1", false, &[POLICY_A, POLICY_B], vec![]),
            cert_with_policies("C1", false, &[POLICY_A], vec![]),
        ];
        let valid = run(&path, PolicyInputs::default(), &[POLICY_A]).unwrap();
        assert_eq!(valid, BTreeSet::from([POLICY_A.to_string()]));
    }

    #[test]
    fn test_disjoint_policies_mismatch() {
        let path = vec![
            cert_with_policies("I1", false, &[POLICY_B], vec![]),
            cert_with_policies("C1", false, &[POLICY_B], vec![]),
        ];
        assert!(run(&path, PolicyInputs::default(), &[POLICY_A]).is_err());
    }

    #[test]
    fn test_any_policy_expands_when_not_inhibited() {
        let path = vec![
            cert_with_policies("I1", false, &[ANY_POLICY], vec![]),
            cert_with_policies("C1", false, &[ANY_POLICY], vec![]),
        ];
        let valid = run(&path, PolicyInputs::default(), &[POLICY_A]).unwrap();
        assert_eq!(valid, BTreeSet::from([POLICY_A.to_string()]));
    }

    #[test]
    fn test_inhibited_any_policy_does_not_satisfy_requirement() {
        let path = vec![
            cert_with_policies("I1", false, &[ANY_POLICY], vec![]),
            cert_with_policies("C1", false, &[ANY_POLICY], vec![]),
        ];
        let inputs = PolicyInputs {
            initial_any_policy_inhibit: true,
            ..Default::default()
        };
        assert!(run(&path, inputs, &[POLICY_A]).is_err());
    }

    #[test]
    fn test_policy_mapping_translates_issuer_domain() {
        // mapping POLICY_B (issuer domain) -> POLICY_A (subject domain)
        let mapping = sequence(vec![sequence(vec![encode_oid(POLICY_B), encode_oid(POLICY_A)])]);
        let ext = CustomExtension::from_oid_content(&[2, 5, 29, 33], mapping);
        let path = vec![
            cert_with_policies("I1", false, &[POLICY_B], vec![ext]),
            cert_with_policies("C1", false, &[POLICY_A], vec![]),
        ];
        let valid = run(&path, PolicyInputs::default(), &[POLICY_B]).unwrap();
        assert_eq!(valid, BTreeSet::from([POLICY_A.to_string()]));

        let inhibited = PolicyInputs {
            initial_policy_mapping_inhibit: true,
            ..Default::default()
        };
        assert!(run(&path, inhibited, &[POLICY_B]).is_err());
    }

    #[test]
    fn test_no_requirement_accepts_empty_tree() {
        let mut params = CertificateParams::new(vec![]);
        params.distinguished_name.push(DnType::CommonName, "C1");
        let der = rcgen::Certificate::from_params(params).unwrap().serialize_der().unwrap();
        let leaf = Certificate::from_der(&der).unwrap();

        let valid = run(&[leaf.clone()], PolicyInputs::default(), &[]).unwrap();
        assert!(valid.is_empty());

        let explicit = PolicyInputs {
            initial_explicit_policy: true,
            ..Default::default()
        };
        assert_eq!(run(&[leaf], explicit, &[]), Err(PolicyViolation::NoAcceptablePolicy));
    }
}

//! Relevance filter: subscribed push datas plus the contracts and headers flags.

use std::collections::HashSet;

use crate::wire::script::{is_contract_marker, push_data_hash, push_datas};
use crate::wire::{Hash20, Transaction};

#[derive(Debug, Default)]
pub struct Filter {
    push_data_hashes: HashSet<Hash20>,
    contracts: bool,
    headers: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds push datas in their matched form. Existing entries are kept.
    pub fn add_push_datas(&mut self, push_datas: &[Vec<u8>]) {
        for data in push_datas {
            self.push_data_hashes.insert(push_data_hash(data));
        }
    }

    pub fn remove_push_datas(&mut self, push_datas: &[Vec<u8>]) {
        for data in push_datas {
            self.push_data_hashes.remove(&push_data_hash(data));
        }
    }

    pub fn push_data_count(&self) -> usize {
        self.push_data_hashes.len()
    }

    pub fn set_contracts(&mut self, subscribed: bool) {
        self.contracts = subscribed;
    }

    pub fn contracts(&self) -> bool {
        self.contracts
    }

    pub fn set_headers(&mut self, subscribed: bool) {
        self.headers = subscribed;
    }

    pub fn headers(&self) -> bool {
        self.headers
    }

    /// A tx is relevant when it creates a contract marker while contracts are subscribed, or
    /// when any output or input pushes a subscribed value.
    pub fn is_relevant(&self, tx: &Transaction, is_test: bool) -> bool {
        if self.contracts
            && tx.output.iter().any(|output| is_contract_marker(&output.script_pubkey, is_test))
        {
            return true;
        }

        if self.push_data_hashes.is_empty() {
            return false;
        }

        let scripts = tx
            .output
            .iter()
            .map(|output| output.script_pubkey.as_slice())
            .chain(tx.input.iter().map(|input| input.script_sig.as_slice()));
        for script in scripts {
            if push_datas(script).any(|data| self.push_data_hashes.contains(&push_data_hash(&data))) {
                return true;
            }
        }
        false
    }
}

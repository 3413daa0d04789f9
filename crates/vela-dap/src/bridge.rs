//! Symbol/type bridge.
//!
//! Wraps the VWP metadata commands with per-session caches and a graceful
//! degradation contract: a missing or failed lookup is `None`, never an error
//! that could abort a translation or a stack trace. Negative results are
//! cached too, so a function the VM has no debug data for is only asked about
//! once.

use std::collections::HashMap;

use parking_lot::Mutex;
use vela_vdwp::{FunctionInfo, LineTableEntry, Location, TypeDesc, TypeInfo, VwpClient};

pub struct SymbolBridge {
    client: VwpClient,
    functions: Mutex<HashMap<u64, Option<FunctionInfo>>>,
    line_tables: Mutex<HashMap<u64, Option<Vec<LineTableEntry>>>>,
    types: Mutex<HashMap<TypeDesc, Option<TypeInfo>>>,
}

impl SymbolBridge {
    pub fn new(client: VwpClient) -> Self {
        Self {
            client,
            functions: Mutex::new(HashMap::new()),
            line_tables: Mutex::new(HashMap::new()),
            types: Mutex::new(HashMap::new()),
        }
    }

    async fn function_info(&self, function_id: u64) -> Option<FunctionInfo> {
        if let Some(cached) = self.functions.lock().get(&function_id) {
            return cached.clone();
        }
        let fetched = self.client.function_info(function_id).await.ok();
        if fetched.is_none() {
            tracing::debug!(target: "vela.dap.bridge", function_id, "no function metadata");
        }
        self.functions.lock().insert(function_id, fetched.clone());
        fetched
    }

    async fn line_table(&self, function_id: u64) -> Option<Vec<LineTableEntry>> {
        if let Some(cached) = self.line_tables.lock().get(&function_id) {
            return cached.clone();
        }
        let fetched = self.client.line_table(function_id).await.ok();
        self.line_tables.lock().insert(function_id, fetched.clone());
        fetched
    }

    async fn type_info(&self, type_desc: TypeDesc) -> Option<TypeInfo> {
        if let Some(cached) = self.types.lock().get(&type_desc) {
            return cached.clone();
        }
        let fetched = self.client.type_info(type_desc).await.ok();
        if fetched.is_none() {
            tracing::debug!(target: "vela.dap.bridge", type_desc, "no type metadata");
        }
        self.types.lock().insert(type_desc, fetched.clone());
        fetched
    }

    pub async fn function_name_of(&self, function_id: u64) -> Option<String> {
        self.function_info(function_id).await.map(|info| info.name)
    }

    /// Map a runtime location back to `(file, line)`.
    ///
    /// The line is the last line-table entry at or before the code index,
    /// matching how the compiler lays entries out.
    pub async fn source_location_of(&self, location: Location) -> Option<(String, u32)> {
        let info = self.function_info(location.function_id).await?;
        let table = self.line_table(location.function_id).await?;
        let line = table
            .iter()
            .filter(|entry| entry.code_index <= location.code_index)
            .max_by_key(|entry| entry.code_index)
            .map(|entry| entry.line)?;
        Some((info.source_file, line))
    }

    pub async fn type_name_of(&self, type_desc: TypeDesc) -> Option<String> {
        self.type_info(type_desc).await.map(|info| info.name)
    }

    /// Declared fields of a record type, in declaration order.
    pub async fn declared_field_types(&self, type_desc: TypeDesc) -> Option<Vec<(String, String)>> {
        self.type_info(type_desc).await.map(|info| info.fields)
    }
}

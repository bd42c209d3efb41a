use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, TryStreamExt};
use index::DEFAULT_PARTITION_N;
use walkdir::WalkDir;

use crate::error::{ClientError, ClientResult};
use crate::node::{
    ByteStream, ClientFactory, ClientOptions, NodeApi, NodeInfo, RemoteClientFactory,
};
use crate::schema::{FieldInfo, IndexInfo, Schema};

const DIR_MODE: u32 = 0o750;
const FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub output_dir: PathBuf,
    pub host: String,
    /// Back up a single index instead of the whole cluster.
    pub index: Option<String>,
    pub concurrency: usize,
    pub no_sync: bool,
    pub client: ClientOptions,
}

/// Streams a point-in-time snapshot of a live cluster into a local archive:
/// schema, identifier allocations, per-shard bitmap data, and key
/// translation, in that order. Within a phase, shards and partitions are
/// fetched by `concurrency` parallel workers; the first failure cancels the
/// remaining work of that phase.
pub struct BackupDriver {
    options: BackupOptions,
    factory: Arc<dyn ClientFactory>,
    primary: Arc<dyn NodeApi>,
}

impl std::fmt::Debug for BackupDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupDriver")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BackupDriver {
    pub fn new(options: BackupOptions) -> ClientResult<BackupDriver> {
        let factory = Arc::new(RemoteClientFactory::new(options.client.clone()));
        BackupDriver::with_factory(options, factory)
    }

    /// Build against a caller-supplied client factory. The driver never
    /// cares how node clients are made.
    pub fn with_factory(
        options: BackupOptions,
        factory: Arc<dyn ClientFactory>,
    ) -> ClientResult<BackupDriver> {
        if options.output_dir.as_os_str().is_empty() {
            return Err(ClientError::bad_input("output directory required"));
        }
        if options.output_dir.exists() {
            return Err(ClientError::bad_input(format!(
                "output directory {} already exists",
                options.output_dir.display()
            )));
        }
        if options.host.is_empty() {
            return Err(ClientError::bad_input("host required"));
        }
        if options.concurrency < 1 {
            return Err(ClientError::bad_input(format!(
                "concurrency {} out of range, must be at least 1",
                options.concurrency
            )));
        }
        if options.client.header_timeout.is_zero() {
            return Err(ClientError::bad_input("header timeout must be positive"));
        }
        let primary = factory.node(&options.host)?;
        Ok(BackupDriver {
            options,
            factory,
            primary,
        })
    }

    pub async fn run(&self) -> ClientResult<()> {
        let schema = self.primary.schema().await?;
        let schema = match &self.options.index {
            Some(name) => schema.filter_index(name)?,
            None => schema,
        };

        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&self.options.output_dir)
            .await?;
        self.check_free_space().await?;
        self.write_schema(&schema)?;
        self.backup_id_allocation().await?;

        for index in &schema.indexes {
            self.backup_index_shards(index).await?;
        }
        // Translation strictly follows shard data for every index: a
        // foreign-key field materialises referent translation rows while
        // shard data is written.
        for index in &schema.indexes {
            self.backup_index_translation(index).await?;
        }

        if !self.options.no_sync {
            self.sync_directories().await?;
        }
        Ok(())
    }

    async fn check_free_space(&self) -> ClientResult<()> {
        let usage = self
            .primary
            .disk_usage(self.options.index.as_deref())
            .await?;
        let free = free_bytes(&self.options.output_dir)?;
        if free < usage {
            return Err(ClientError::bad_input(format!(
                "insufficient free space at {}: cluster reports {usage} bytes, destination has {free}",
                self.options.output_dir.display()
            )));
        }
        log::debug!("free-space preflight: need {usage} bytes, have {free}");
        Ok(())
    }

    fn write_schema(&self, schema: &Schema) -> ClientResult<()> {
        let path = self.options.output_dir.join("schema");
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(path)?;
        let mut writer = std::io::BufWriter::new(file);
        schema.write_indented(&mut writer)?;
        writer.flush()?;
        if !self.options.no_sync {
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    async fn backup_id_allocation(&self) -> ClientResult<()> {
        log::info!("backing up id allocation");
        let reader = self.primary.id_allocation_data().await?;
        self.write_stream(reader, &self.options.output_dir.join("idalloc"))
            .await
    }

    async fn backup_index_shards(&self, index: &IndexInfo) -> ClientResult<()> {
        let shards = self.primary.available_shards(&index.name).await?;
        log::info!("backing up index {}: {} shards", index.name, shards.len());
        stream::iter(shards.into_iter().map(Ok::<u64, ClientError>))
            .try_for_each_concurrent(self.options.concurrency, |shard| async move {
                self.backup_shard(&index.name, shard).await
            })
            .await
    }

    /// Try each replica holding the shard, in order; the first success wins
    /// and only the first error is reported.
    async fn backup_shard(&self, index: &str, shard: u64) -> ClientResult<()> {
        let nodes = self.primary.fragment_nodes(index, shard).await?;
        if nodes.is_empty() {
            return Err(ClientError::NoNodesAvailable);
        }
        let mut first_err: Option<ClientError> = None;
        for node in &nodes {
            match self.backup_shard_node(index, shard, node).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::warn!(
                        "backing up shard {index}/{shard} from {}: {err}",
                        node.uri
                    );
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        Err(first_err.unwrap_or(ClientError::NoNodesAvailable))
    }

    async fn backup_shard_node(
        &self,
        index: &str,
        shard: u64,
        node: &NodeInfo,
    ) -> ClientResult<()> {
        let client = self.factory.node(&node.uri)?;
        let reader = client.shard_data(index, shard).await?;
        let path = self
            .options
            .output_dir
            .join("indexes")
            .join(index)
            .join("shards")
            .join(format!("{shard:04}"));
        self.write_stream(reader, &path).await
    }

    async fn backup_index_translation(&self, index: &IndexInfo) -> ClientResult<()> {
        if index.options.keys {
            log::info!("backing up translation for index {}", index.name);
            stream::iter((0..DEFAULT_PARTITION_N).map(Ok::<usize, ClientError>))
                .try_for_each_concurrent(self.options.concurrency, |partition| async move {
                    let reader = self
                        .primary
                        .index_translate_data(&index.name, partition)
                        .await?;
                    let path = self
                        .options
                        .output_dir
                        .join("indexes")
                        .join(&index.name)
                        .join("translate")
                        .join(format!("{partition:04}"));
                    self.write_stream(reader, &path).await
                })
                .await?;
        }

        let keyed_fields = index.fields.iter().filter(|field| field.options.keys);
        stream::iter(keyed_fields.map(Ok::<&FieldInfo, ClientError>))
            .try_for_each_concurrent(self.options.concurrency, |field| async move {
                let reader = self
                    .primary
                    .field_translate_data(&index.name, &field.name)
                    .await?;
                let path = self
                    .options
                    .output_dir
                    .join("indexes")
                    .join(&index.name)
                    .join("fields")
                    .join(&field.name)
                    .join("translate");
                self.write_stream(reader, &path).await
            })
            .await
    }

    async fn write_stream(&self, mut reader: ByteStream, path: &Path) -> ClientResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(parent)
                .await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(path)
            .await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        if !self.options.no_sync {
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Make every directory entry in the archive durable. The parent of the
    /// output directory goes first, so the archive's own entry survives.
    async fn sync_directories(&self) -> ClientResult<()> {
        let output_dir = tokio::fs::canonicalize(&self.options.output_dir).await?;
        let mut dirs = Vec::new();
        if let Some(parent) = output_dir.parent() {
            dirs.push(parent.to_path_buf());
        }
        for entry in WalkDir::new(&output_dir) {
            let entry = entry?;
            if entry.file_type().is_dir() {
                dirs.push(entry.into_path());
            }
        }
        stream::iter(dirs.into_iter().map(Ok::<PathBuf, ClientError>))
            .try_for_each_concurrent(self.options.concurrency, |dir| async move {
                tokio::task::spawn_blocking(move || -> ClientResult<()> {
                    let file = std::fs::File::open(&dir)?;
                    file.sync_all()?;
                    Ok(())
                })
                .await?
            })
            .await
    }
}

fn free_bytes(path: &Path) -> ClientResult<u64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::schema::{FieldInfo, FieldOptions, IndexOptions};

    #[derive(Default)]
    struct SpyCluster {
        schema: Schema,
        shards: HashMap<String, Vec<u64>>,
        nodes: Vec<NodeInfo>,
        failing: Vec<String>,
        shard_payload: Vec<u8>,
        disk_usage: u64,
        log: Mutex<Vec<String>>,
    }

    impl SpyCluster {
        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    struct SpyNode {
        cluster: Arc<SpyCluster>,
        uri: String,
    }

    #[async_trait]
    impl NodeApi for SpyNode {
        async fn schema(&self) -> ClientResult<Schema> {
            Ok(self.cluster.schema.clone())
        }

        async fn disk_usage(&self, _index: Option<&str>) -> ClientResult<u64> {
            Ok(self.cluster.disk_usage)
        }

        async fn id_allocation_data(&self) -> ClientResult<ByteStream> {
            self.cluster.record("idalloc".into());
            Ok(Box::pin(Cursor::new(b"ids".to_vec())))
        }

        async fn available_shards(&self, index: &str) -> ClientResult<Vec<u64>> {
            Ok(self.cluster.shards.get(index).cloned().unwrap_or_default())
        }

        async fn fragment_nodes(&self, _index: &str, _shard: u64) -> ClientResult<Vec<NodeInfo>> {
            Ok(self.cluster.nodes.clone())
        }

        async fn shard_data(&self, index: &str, shard: u64) -> ClientResult<ByteStream> {
            self.cluster
                .record(format!("shard-data {} {index} {shard}", self.uri));
            if self.cluster.failing.contains(&self.uri) {
                return Err(ClientError::service_error("connection refused"));
            }
            Ok(Box::pin(Cursor::new(self.cluster.shard_payload.clone())))
        }

        async fn index_translate_data(
            &self,
            index: &str,
            partition: usize,
        ) -> ClientResult<ByteStream> {
            self.cluster
                .record(format!("index-translate {index} {partition}"));
            Ok(Box::pin(Cursor::new(b"keys".to_vec())))
        }

        async fn field_translate_data(
            &self,
            index: &str,
            field: &str,
        ) -> ClientResult<ByteStream> {
            self.cluster
                .record(format!("field-translate {index} {field}"));
            Ok(Box::pin(Cursor::new(b"fieldkeys".to_vec())))
        }
    }

    struct SpyFactory {
        cluster: Arc<SpyCluster>,
    }

    impl ClientFactory for SpyFactory {
        fn node(&self, uri: &str) -> ClientResult<Arc<dyn NodeApi>> {
            Ok(Arc::new(SpyNode {
                cluster: Arc::clone(&self.cluster),
                uri: uri.to_string(),
            }))
        }
    }

    fn single_node() -> Vec<NodeInfo> {
        vec![NodeInfo {
            id: "node0".into(),
            uri: "node0:10101".into(),
        }]
    }

    fn keyed_index(name: &str, fields: Vec<FieldInfo>) -> IndexInfo {
        IndexInfo {
            name: name.into(),
            options: IndexOptions {
                keys: true,
                track_existence: true,
            },
            fields,
        }
    }

    fn driver(
        out: PathBuf,
        cluster: &Arc<SpyCluster>,
        index: Option<String>,
        no_sync: bool,
    ) -> ClientResult<BackupDriver> {
        BackupDriver::with_factory(
            BackupOptions {
                output_dir: out,
                host: "primary:10101".into(),
                index,
                concurrency: 2,
                no_sync,
                client: ClientOptions::default(),
            },
            Arc::new(SpyFactory {
                cluster: Arc::clone(cluster),
            }),
        )
    }

    #[test]
    fn test_validation() {
        let cluster = Arc::new(SpyCluster::default());
        assert!(driver(PathBuf::new(), &cluster, None, true).is_err());

        let dir = tempfile::tempdir().unwrap();
        // Destination must not already exist.
        assert!(driver(dir.path().to_path_buf(), &cluster, None, true).is_err());

        let out = dir.path().join("backup");
        let err = BackupDriver::with_factory(
            BackupOptions {
                output_dir: out,
                host: "primary:10101".into(),
                index: None,
                concurrency: 0,
                no_sync: true,
                client: ClientOptions::default(),
            },
            Arc::new(SpyFactory {
                cluster: Arc::clone(&cluster),
            }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[tokio::test]
    async fn test_archive_layout() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("backup");
        let schema = Schema {
            indexes: vec![
                keyed_index(
                    "a",
                    vec![FieldInfo {
                        name: "color".into(),
                        options: FieldOptions {
                            keys: true,
                            field_type: Some("set".into()),
                            foreign_index: None,
                        },
                    }],
                ),
                IndexInfo {
                    name: "b".into(),
                    options: IndexOptions::default(),
                    fields: vec![],
                },
            ],
        };
        let cluster = Arc::new(SpyCluster {
            schema: schema.clone(),
            shards: HashMap::from([("a".into(), vec![0, 1]), ("b".into(), vec![0])]),
            nodes: single_node(),
            shard_payload: b"payload".to_vec(),
            ..Default::default()
        });

        driver(out.clone(), &cluster, None, true)
            .unwrap()
            .run()
            .await
            .unwrap();

        let written: Schema =
            serde_json::from_slice(&std::fs::read(out.join("schema")).unwrap()).unwrap();
        assert_eq!(written, schema);
        assert_eq!(std::fs::read(out.join("idalloc")).unwrap(), b"ids");

        for shard_file in ["0000", "0001"] {
            let data = std::fs::read(out.join("indexes/a/shards").join(shard_file)).unwrap();
            assert_eq!(data, b"payload");
        }
        assert_eq!(
            std::fs::read(out.join("indexes/b/shards/0000")).unwrap(),
            b"payload"
        );

        let partitions = std::fs::read_dir(out.join("indexes/a/translate"))
            .unwrap()
            .count();
        assert_eq!(partitions, DEFAULT_PARTITION_N);
        assert_eq!(
            std::fs::read(out.join("indexes/a/translate/0000")).unwrap(),
            b"keys"
        );
        assert_eq!(
            std::fs::read(out.join("indexes/a/fields/color/translate")).unwrap(),
            b"fieldkeys"
        );
        // Index b has no key translation.
        assert!(!out.join("indexes/b/translate").exists());
    }

    #[tokio::test]
    async fn test_translation_follows_all_shard_data() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("backup");
        // Index b carries a foreign-key field into index a.
        let schema = Schema {
            indexes: vec![
                keyed_index("a", vec![]),
                keyed_index(
                    "b",
                    vec![FieldInfo {
                        name: "parent".into(),
                        options: FieldOptions {
                            keys: true,
                            field_type: Some("set".into()),
                            foreign_index: Some("a".into()),
                        },
                    }],
                ),
            ],
        };
        let cluster = Arc::new(SpyCluster {
            schema,
            shards: HashMap::from([("a".into(), vec![0, 1, 2]), ("b".into(), vec![0, 1])]),
            nodes: single_node(),
            shard_payload: b"x".to_vec(),
            ..Default::default()
        });

        driver(out, &cluster, None, true).unwrap().run().await.unwrap();

        let entries = cluster.entries();
        let last_shard = entries
            .iter()
            .rposition(|entry| entry.starts_with("shard-data"))
            .unwrap();
        let first_translate = entries
            .iter()
            .position(|entry| entry.contains("translate"))
            .unwrap();
        assert!(
            last_shard < first_translate,
            "translation dumped before shard data: {entries:?}"
        );
    }

    #[tokio::test]
    async fn test_replica_failover_first_success_wins() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("backup");
        let payload = b"seven!!".to_vec();
        assert_eq!(payload.len(), 7);
        let cluster = Arc::new(SpyCluster {
            schema: Schema {
                indexes: vec![IndexInfo {
                    name: "x".into(),
                    ..Default::default()
                }],
            },
            shards: HashMap::from([("x".into(), vec![0])]),
            nodes: vec![
                NodeInfo {
                    id: "node1".into(),
                    uri: "node1:10101".into(),
                },
                NodeInfo {
                    id: "node2".into(),
                    uri: "node2:10101".into(),
                },
                NodeInfo {
                    id: "node3".into(),
                    uri: "node3:10101".into(),
                },
            ],
            failing: vec!["node1:10101".into(), "node2:10101".into()],
            shard_payload: payload.clone(),
            ..Default::default()
        });

        driver(out.clone(), &cluster, None, true)
            .unwrap()
            .run()
            .await
            .unwrap();

        let data = std::fs::read(out.join("indexes/x/shards/0000")).unwrap();
        assert_eq!(data, payload);

        let reads: Vec<String> = cluster
            .entries()
            .into_iter()
            .filter(|entry| entry.starts_with("shard-data"))
            .collect();
        assert_eq!(
            reads,
            vec![
                "shard-data node1:10101 x 0",
                "shard-data node2:10101 x 0",
                "shard-data node3:10101 x 0",
            ]
        );
    }

    #[tokio::test]
    async fn test_all_replicas_failing_reports_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("backup");
        let cluster = Arc::new(SpyCluster {
            schema: Schema {
                indexes: vec![IndexInfo {
                    name: "x".into(),
                    ..Default::default()
                }],
            },
            shards: HashMap::from([("x".into(), vec![0])]),
            nodes: vec![NodeInfo {
                id: "node1".into(),
                uri: "node1:10101".into(),
            }],
            failing: vec!["node1:10101".into()],
            ..Default::default()
        });

        let err = driver(out, &cluster, None, true)
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_no_nodes_available() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("backup");
        let cluster = Arc::new(SpyCluster {
            schema: Schema {
                indexes: vec![IndexInfo {
                    name: "x".into(),
                    ..Default::default()
                }],
            },
            shards: HashMap::from([("x".into(), vec![0])]),
            nodes: vec![],
            ..Default::default()
        });

        let err = driver(out, &cluster, None, true)
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no nodes available");
    }

    #[tokio::test]
    async fn test_index_filter_missing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("backup");
        let cluster = Arc::new(SpyCluster {
            schema: Schema {
                indexes: vec![keyed_index("a", vec![])],
            },
            nodes: single_node(),
            ..Default::default()
        });

        let err = driver(out, &cluster, Some("missing".into()), true)
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "index not found to back up");
    }

    #[tokio::test]
    async fn test_free_space_preflight_fails_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("backup");
        let cluster = Arc::new(SpyCluster {
            schema: Schema {
                indexes: vec![keyed_index("a", vec![])],
            },
            nodes: single_node(),
            disk_usage: u64::MAX,
            ..Default::default()
        });

        let err = driver(out.clone(), &cluster, None, true)
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("insufficient free space"));
        assert!(!out.join("schema").exists());
    }

    #[tokio::test]
    async fn test_sync_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("backup");
        let cluster = Arc::new(SpyCluster {
            schema: Schema {
                indexes: vec![IndexInfo {
                    name: "x".into(),
                    ..Default::default()
                }],
            },
            shards: HashMap::from([("x".into(), vec![3])]),
            nodes: single_node(),
            shard_payload: b"data".to_vec(),
            ..Default::default()
        });

        driver(out.clone(), &cluster, None, false)
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(out.join("indexes/x/shards/0003")).unwrap(),
            b"data"
        );
    }
}

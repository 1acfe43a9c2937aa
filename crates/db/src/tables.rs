use std::fmt;

/// The buckets of the sync store.
///
/// Beacon-shard data lives in separately named buckets; use
/// [`Bucket::for_beacon`] to resolve the shard-scoped ones. Stage progress
/// keys embed the beacon flag in the key instead, so the progress buckets
/// have no beacon counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    /// Forward progress per stage.
    StageProgress,
    /// Cleanup progress per stage.
    StageCleanUpProgress,
    /// Canonical hash per block number, built ahead of body download.
    BlockHashes,
    /// Beacon variant of [`Bucket::BlockHashes`].
    BeaconBlockHashes,
    /// RLP-encoded block bodies, written to worker scratch databases.
    Blocks,
    /// Commit signatures, written to worker scratch databases.
    BlockSignatures,
    /// Auxiliary hash index, cleared by the finish stage.
    ExtraBlockHashes,
    /// Beacon variant of [`Bucket::ExtraBlockHashes`].
    BeaconExtraBlockHashes,
    /// Auxiliary downloaded-block cache, cleared by the finish stage.
    DownloadedBlocks,
    /// Beacon variant of [`Bucket::DownloadedBlocks`].
    BeaconDownloadedBlocks,
}

impl Bucket {
    /// Every bucket, in declaration order.
    pub const ALL: [Bucket; 10] = [
        Bucket::StageProgress,
        Bucket::StageCleanUpProgress,
        Bucket::BlockHashes,
        Bucket::BeaconBlockHashes,
        Bucket::Blocks,
        Bucket::BlockSignatures,
        Bucket::ExtraBlockHashes,
        Bucket::BeaconExtraBlockHashes,
        Bucket::DownloadedBlocks,
        Bucket::BeaconDownloadedBlocks,
    ];

    /// The persisted name of the bucket.
    pub const fn name(&self) -> &'static str {
        match self {
            Bucket::StageProgress => "StageProgress",
            Bucket::StageCleanUpProgress => "StageCleanUpProgress",
            Bucket::BlockHashes => "BlockHashes",
            Bucket::BeaconBlockHashes => "BeaconBlockHashes",
            Bucket::Blocks => "Blocks",
            Bucket::BlockSignatures => "BlockSignatures",
            Bucket::ExtraBlockHashes => "ExtraBlockHashes",
            Bucket::BeaconExtraBlockHashes => "BeaconExtraBlockHashes",
            Bucket::DownloadedBlocks => "DownloadedBlocks",
            Bucket::BeaconDownloadedBlocks => "BeaconDownloadedBlocks",
        }
    }

    /// Resolve the bucket for the given shard kind.
    ///
    /// Buckets without a beacon counterpart resolve to themselves.
    pub const fn for_beacon(self, is_beacon: bool) -> Bucket {
        if !is_beacon {
            return self
        }
        match self {
            Bucket::BlockHashes => Bucket::BeaconBlockHashes,
            Bucket::ExtraBlockHashes => Bucket::BeaconExtraBlockHashes,
            Bucket::DownloadedBlocks => Bucket::BeaconDownloadedBlocks,
            other => other,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

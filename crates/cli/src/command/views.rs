use atomstore_ingest::{AtomDetail, AtomSearch, DedupStats, DeleteOutcome, FileBreakdown, FileRecord, VerifyReport};
use atomstore_protocol::{
    AtomView, DedupStatsView, DeleteResult, FileAtom, FileAtomsResponse, GcResult,
    SearchResponse, TopAtomView, UploadResult, VerifyResult,
};
use atomstore_store::GcReport;

pub fn atom_view(detail: AtomDetail) -> AtomView {
    let AtomDetail { atom, files } = detail;
    AtomView {
        hash: atom.fingerprint.to_string(),
        size: atom.size,
        kind: atom.kind.as_str().to_string(),
        created_at: atom.created_at,
        usage_count: atom.usage_count,
        files,
    }
}

pub fn search_response(search: AtomSearch) -> SearchResponse {
    SearchResponse {
        atoms: search.atoms.into_iter().map(atom_view).collect(),
        total: search.total,
    }
}

pub fn upload_result(record: &FileRecord) -> UploadResult {
    UploadResult {
        file_id: record.file_id.to_string(),
        filename: record.filename.clone(),
        size: record.total_size,
        atoms_created: record.atoms_created,
        atoms_reused: record.atoms_reused,
        dedup_ratio: record.dedup_ratio(),
        storage_saved: record.storage_saved(),
        hash: record.fingerprint.to_string(),
        processing_time_ms: record.processing_time_ms,
    }
}

pub fn file_atoms(breakdown: FileBreakdown) -> FileAtomsResponse {
    FileAtomsResponse {
        atoms: breakdown
            .atoms
            .into_iter()
            .map(|atom| FileAtom {
                hash: atom.fingerprint.to_string(),
                size: atom.size,
                is_new: atom.is_new,
                reuse_count: atom.reuse_count,
            })
            .collect(),
    }
}

pub fn dedup_stats(stats: DedupStats) -> DedupStatsView {
    DedupStatsView {
        total_files: stats.total_files,
        total_size: stats.total_size,
        total_atoms: stats.total_atoms,
        unique_atoms: stats.unique_atoms,
        physical_size: stats.physical_size,
        storage_saved: stats.storage_saved,
        dedup_ratio: stats.dedup_ratio,
        avg_reuse: stats.avg_reuse,
        top_atoms: stats
            .top_atoms
            .into_iter()
            .map(|top| TopAtomView {
                hash: top.fingerprint.to_string(),
                usage_count: top.usage_count,
                size: top.size,
            })
            .collect(),
    }
}

pub fn delete_result(outcome: DeleteOutcome) -> DeleteResult {
    DeleteResult {
        file_id: outcome.file_id.to_string(),
        atoms_unlinked: outcome.atoms_unlinked,
        orphaned: outcome.orphaned,
    }
}

pub fn gc_result(report: &GcReport) -> GcResult {
    GcResult {
        evicted: report.evicted.len(),
        bytes_freed: report.bytes_freed,
        deferred: report.deferred,
        stray_payloads: report.stray_payloads,
    }
}

pub fn verify_result(report: VerifyReport) -> VerifyResult {
    let ok = report.is_ok();
    let VerifyReport { invariants, stats } = report;
    VerifyResult {
        ok,
        atoms_checked: invariants.atoms_checked,
        orphans: invariants.orphans,
        unclaimed_references: invariants.unclaimed_references,
        violations: invariants.violations,
        stats_drift: stats.drift,
        store_mismatches: stats.store_mismatches,
    }
}

//! The `fs` capability.
use std::sync::Arc;

use crate::dispatch::{method_table, CallContext, CallError, Capability, HostObject, MethodResult};
use crate::resources::{ResourceTracker, Tracking, TrackingField};
use crate::value::{Args, Value};

use super::handle::{self, OpenMode};
use super::{path, FileSystem};

method_table! {
    pub enum FsMethod {
        List => "list",
        Combine => "combine",
        GetName => "getName",
        GetSize => "getSize",
        Exists => "exists",
        IsDir => "isDir",
        IsReadOnly => "isReadOnly",
        MakeDir => "makeDir",
        Move => "move",
        Copy => "copy",
        Delete => "delete",
        Open => "open",
        GetDrive => "getDrive",
        GetFreeSpace => "getFreeSpace",
        Find => "find",
        GetDir => "getDir",
    }
}

pub struct FsApi {
    fs: Arc<FileSystem>,
    tracker: Arc<ResourceTracker>,
    tracking: Arc<Tracking>,
}

impl FsApi {
    pub fn new(fs: Arc<FileSystem>, tracker: Arc<ResourceTracker>, tracking: Arc<Tracking>) -> Self {
        Self {
            fs,
            tracker,
            tracking,
        }
    }

    pub fn filesystem(&self) -> &FileSystem {
        &self.fs
    }

    fn count_op(&self) {
        self.tracking.add(TrackingField::FsOps, 1);
    }

    fn dispatch(&self, method: FsMethod, args: Args<'_>) -> Result<MethodResult, CallError> {
        match method {
            FsMethod::List => {
                let path = args.string(0)?;
                self.count_op();
                Ok(MethodResult::of(self.fs.list(path)?))
            }
            FsMethod::Combine => {
                let mut combined = args.string(0)?.to_string();
                for index in 1..args.len().max(2) {
                    combined = path::combine(&combined, args.string(index)?);
                }
                Ok(MethodResult::of(combined))
            }
            FsMethod::GetName => Ok(MethodResult::of(path::get_name(args.string(0)?))),
            FsMethod::GetDir => Ok(MethodResult::of(path::get_directory(args.string(0)?))),
            FsMethod::GetSize => {
                let path = args.string(0)?;
                self.count_op();
                Ok(MethodResult::of(self.fs.get_size(path)?))
            }
            // Queries that answer false rather than fail.
            FsMethod::Exists => {
                let path = args.string(0)?;
                Ok(MethodResult::of(self.fs.exists(path).unwrap_or(false)))
            }
            FsMethod::IsDir => {
                let path = args.string(0)?;
                Ok(MethodResult::of(self.fs.is_dir(path).unwrap_or(false)))
            }
            FsMethod::IsReadOnly => {
                let path = args.string(0)?;
                Ok(MethodResult::of(self.fs.is_read_only(path).unwrap_or(false)))
            }
            FsMethod::MakeDir => {
                let path = args.string(0)?;
                self.count_op();
                self.fs.make_dir(path)?;
                Ok(MethodResult::empty())
            }
            FsMethod::Move => {
                let (source, dest) = (args.string(0)?, args.string(1)?);
                self.count_op();
                self.fs.move_path(source, dest)?;
                Ok(MethodResult::empty())
            }
            FsMethod::Copy => {
                let (source, dest) = (args.string(0)?, args.string(1)?);
                self.count_op();
                self.fs.copy(source, dest)?;
                Ok(MethodResult::empty())
            }
            FsMethod::Delete => {
                let path = args.string(0)?;
                self.count_op();
                self.fs.delete(path)?;
                Ok(MethodResult::empty())
            }
            FsMethod::Open => {
                let path = args.string(0)?;
                let mode = args.string(1)?;
                let mode =
                    OpenMode::parse(mode).ok_or_else(|| CallError::message("Unsupported mode"))?;
                self.count_op();
                // A store failure is a (nil, message) result, not a raised error.
                Ok(match handle::open(&self.fs, &self.tracker, path, mode) {
                    Ok(handle) => MethodResult::of(Value::Object(handle)),
                    Err(e) => MethodResult::values(vec![Value::Nil, Value::from(e.to_string())]),
                })
            }
            FsMethod::GetDrive => {
                let path = args.string(0)?;
                if !self.fs.exists(path)? {
                    return Ok(MethodResult::empty());
                }
                Ok(MethodResult::of(self.fs.mount_label(path)?))
            }
            FsMethod::GetFreeSpace => {
                let path = args.string(0)?;
                Ok(match self.fs.free_space(path)? {
                    Some(bytes) => MethodResult::of(bytes),
                    None => MethodResult::of("unlimited"),
                })
            }
            FsMethod::Find => {
                let pattern = args.string(0)?;
                self.count_op();
                Ok(MethodResult::of(self.fs.find(pattern)?))
            }
        }
    }
}

impl HostObject for FsApi {
    fn method_names(&self) -> &'static [&'static str] {
        FsMethod::NAMES
    }

    fn call(&self, _context: &CallContext, method: usize, args: &[Value]) -> MethodResult {
        match FsMethod::from_index(method) {
            Some(method) => self.dispatch(method, Args::new(args)).into(),
            None => CallError::NoSuchMethod.into(),
        }
    }
}

impl Capability for FsApi {
    fn names(&self) -> &'static [&'static str] {
        &["fs"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::DirMount;

    struct Fixture {
        _dir: tempfile::TempDir,
        tracker: Arc<ResourceTracker>,
        tracking: Arc<Tracking>,
        api: FsApi,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::new("hdd", Arc::new(DirMount::new(dir.path(), None).unwrap()));
        let tracker = ResourceTracker::new();
        let tracking = Tracking::new();
        let api = FsApi::new(Arc::new(fs), tracker.clone(), tracking.clone());
        Fixture {
            _dir: dir,
            tracker,
            tracking,
            api,
        }
    }

    fn call(api: &FsApi, method: FsMethod, args: Vec<Value>) -> MethodResult {
        api.call(&CallContext::new(0, 0), method as usize, &args)
    }

    fn immediate(result: MethodResult) -> Vec<Value> {
        match result {
            MethodResult::Immediate(values) => values,
            other => panic!("Expected Immediate, got {other:?}"),
        }
    }

    fn failure(result: MethodResult) -> String {
        match result {
            MethodResult::Failure(msg) => msg,
            other => panic!("Expected Failure, got {other:?}"),
        }
    }

    fn write_file(api: &FsApi, path: &str, content: &str) {
        let values = immediate(call(api, FsMethod::Open, vec![path.into(), "w".into()]));
        let handle = values[0].as_object().unwrap().clone();
        handle.call(&CallContext::new(0, 0), 0, &[content.into()]);
        handle.call(&CallContext::new(0, 0), 3, &[]);
    }

    // ── Ordinal tests ─────────────────────────────────────

    #[test]
    fn test_method_table_order() {
        assert_eq!(FsMethod::NAMES.len(), 16);
        assert_eq!(FsMethod::NAMES[0], "list");
        assert_eq!(FsMethod::NAMES[11], "open");
        assert_eq!(FsMethod::NAMES[15], "getDir");
    }

    #[test]
    fn test_unknown_ordinal() {
        let f = fixture();
        assert_eq!(failure(f.api.call(&CallContext::new(0, 0), 16, &[])), "No such method");
    }

    // ── Path method tests ─────────────────────────────────

    #[test]
    fn test_path_methods() {
        let f = fixture();
        assert_eq!(
            immediate(call(&f.api, FsMethod::Combine, vec!["a/b".into(), "../c".into()])),
            vec![Value::from("a/c")]
        );
        assert_eq!(
            immediate(call(&f.api, FsMethod::GetName, vec!["".into()])),
            vec![Value::from("root")]
        );
        assert_eq!(
            immediate(call(&f.api, FsMethod::GetDir, vec!["x/y".into()])),
            vec![Value::from("x")]
        );
    }

    #[test]
    fn test_combine_requires_two_strings() {
        let f = fixture();
        assert_eq!(
            failure(call(&f.api, FsMethod::Combine, vec!["a".into()])),
            "bad argument #2 (string expected, got nil)"
        );
    }

    // ── Query tests ───────────────────────────────────────

    #[test]
    fn test_soft_queries_answer_false_on_bad_paths() {
        let f = fixture();
        for method in [FsMethod::Exists, FsMethod::IsDir, FsMethod::IsReadOnly] {
            assert_eq!(
                immediate(call(&f.api, method, vec!["../outside".into()])),
                vec![Value::from(false)]
            );
        }
    }

    #[test]
    fn test_list_failure_is_raised() {
        let f = fixture();
        assert_eq!(
            failure(call(&f.api, FsMethod::List, vec!["../outside".into()])),
            "Invalid Path"
        );
        assert_eq!(
            failure(call(&f.api, FsMethod::List, vec!["nope".into()])),
            "/nope: Not a directory"
        );
    }

    #[test]
    fn test_get_drive_and_free_space() {
        let f = fixture();
        assert_eq!(
            immediate(call(&f.api, FsMethod::GetDrive, vec!["".into()])),
            vec![Value::from("hdd")]
        );
        assert!(immediate(call(&f.api, FsMethod::GetDrive, vec!["missing".into()])).is_empty());
        assert_eq!(
            immediate(call(&f.api, FsMethod::GetFreeSpace, vec!["".into()])),
            vec![Value::from("unlimited")]
        );
    }

    // ── open tests ────────────────────────────────────────

    #[test]
    fn test_open_missing_returns_nil_and_message() {
        let f = fixture();
        let values = immediate(call(&f.api, FsMethod::Open, vec!["missing".into(), "r".into()]));
        assert_eq!(values, vec![Value::Nil, Value::from("/missing: No such file")]);
    }

    #[test]
    fn test_open_bad_mode_fails() {
        let f = fixture();
        assert_eq!(
            failure(call(&f.api, FsMethod::Open, vec!["x".into(), "rw".into()])),
            "Unsupported mode"
        );
    }

    #[test]
    fn test_open_escaping_path_returns_nil_and_message() {
        let f = fixture();
        for mode in ["r", "w", "ab"] {
            let values = immediate(call(&f.api, FsMethod::Open, vec!["../x".into(), mode.into()]));
            assert_eq!(values, vec![Value::Nil, Value::from("Invalid Path")]);
        }
        assert_eq!(f.tracker.open_count(), 0);
    }

    #[test]
    fn test_open_tracks_handle() {
        let f = fixture();
        write_file(&f.api, "notes", "hello");
        let values = immediate(call(&f.api, FsMethod::Open, vec!["notes".into(), "r".into()]));
        assert!(values[0].as_object().is_some());
        assert_eq!(f.tracker.open_count(), 1);
    }

    // ── Mutation tests ────────────────────────────────────

    #[test]
    fn test_file_lifecycle() {
        let f = fixture();
        immediate(call(&f.api, FsMethod::MakeDir, vec!["docs".into()]));
        write_file(&f.api, "docs/a.txt", "12345");
        assert_eq!(
            immediate(call(&f.api, FsMethod::GetSize, vec!["docs/a.txt".into()])),
            vec![Value::from(5)]
        );
        immediate(call(&f.api, FsMethod::Copy, vec!["docs/a.txt".into(), "b.txt".into()]));
        immediate(call(&f.api, FsMethod::Move, vec!["b.txt".into(), "docs/b.txt".into()]));
        assert_eq!(
            immediate(call(&f.api, FsMethod::List, vec!["docs".into()])),
            vec![Value::List(vec!["a.txt".into(), "b.txt".into()])]
        );
        assert_eq!(
            immediate(call(&f.api, FsMethod::Find, vec!["docs/*.txt".into()])),
            vec![Value::List(vec!["docs/a.txt".into(), "docs/b.txt".into()])]
        );
        immediate(call(&f.api, FsMethod::Delete, vec!["docs".into()]));
        assert_eq!(
            immediate(call(&f.api, FsMethod::Exists, vec!["docs".into()])),
            vec![Value::from(false)]
        );
    }

    #[test]
    fn test_move_errors_are_raised() {
        let f = fixture();
        assert_eq!(
            failure(call(&f.api, FsMethod::Move, vec!["a".into(), "b".into()])),
            "/a: No such file"
        );
    }

    #[test]
    fn test_operations_are_counted() {
        let f = fixture();
        call(&f.api, FsMethod::List, vec!["".into()]);
        call(&f.api, FsMethod::MakeDir, vec!["d".into()]);
        call(&f.api, FsMethod::Exists, vec!["d".into()]);
        assert_eq!(f.tracking.get(TrackingField::FsOps), 2);
    }
}

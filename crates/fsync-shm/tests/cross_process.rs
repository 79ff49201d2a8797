//! Two processes mapping the same backing file through separate pools.

use std::sync::atomic::Ordering;
use std::time::Duration;

use fsync_futex::{WaitOutcome, futex_wait, futex_wake};
use fsync_shm::SharedPagePool;
use fsync_shm::pool::system_page_size;
use fsync_types::SlotIndex;

fn backing_file() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fsync-cross");
    let file = std::fs::File::create(&path).unwrap();
    file.set_len(system_page_size().unwrap() as u64).unwrap();
    (dir, path)
}

fn wait_child(child: libc::pid_t) -> i32 {
    let mut status: libc::c_int = 0;
    unsafe { libc::waitpid(child, &mut status, 0) };
    assert!(libc::WIFEXITED(status), "child did not exit normally");
    libc::WEXITSTATUS(status)
}

#[test]
fn child_store_is_visible_to_parent() {
    let (_dir, path) = backing_file();
    let parent = SharedPagePool::open(&path).unwrap();
    let sem = parent.get_shm(SlotIndex::new(40)).unwrap().semaphore();
    assert_eq!(sem.count(), 0);

    let child = unsafe { libc::fork() };
    if child == 0 {
        let code = match SharedPagePool::open(&path) {
            Ok(pool) => match pool.get_shm(SlotIndex::new(40)) {
                Some(block) => {
                    let sem = block.semaphore();
                    sem.max_word().store(10, Ordering::Release);
                    sem.count_word().store(4, Ordering::Release);
                    0
                }
                None => 2,
            },
            Err(_) => 1,
        };
        unsafe { libc::_exit(code) };
    }
    assert!(child > 0, "fork failed");

    assert_eq!(wait_child(child), 0);
    assert_eq!(sem.count(), 4);
    assert_eq!(sem.max(), 10);
}

#[test]
fn futex_wake_crosses_processes() {
    let (_dir, path) = backing_file();
    let pool = SharedPagePool::open(&path).unwrap();
    let word = pool
        .get_shm(SlotIndex::new(3))
        .unwrap()
        .semaphore()
        .count_word();

    let child = unsafe { libc::fork() };
    if child == 0 {
        let code = match SharedPagePool::open(&path) {
            Ok(pool) => match pool.get_shm(SlotIndex::new(3)) {
                Some(block) => {
                    let word = block.semaphore().count_word();
                    let mut code = 3;
                    for _ in 0..200 {
                        if word.load(Ordering::Acquire) == 1 {
                            code = 0;
                            break;
                        }
                        match futex_wait(word, 0, Some(Duration::from_millis(50))) {
                            Ok(_) => {}
                            Err(_) => {
                                code = 4;
                                break;
                            }
                        }
                    }
                    code
                }
                None => 2,
            },
            Err(_) => 1,
        };
        unsafe { libc::_exit(code) };
    }
    assert!(child > 0, "fork failed");

    std::thread::sleep(Duration::from_millis(20));
    word.store(1, Ordering::Release);
    futex_wake(word, 1).unwrap();

    assert_eq!(wait_child(child), 0);
    // A stale expected value never blocks.
    assert_eq!(
        futex_wait(word, 0, None).unwrap(),
        WaitOutcome::ValueMismatch
    );
}

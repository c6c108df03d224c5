//! Per-operation I/O counters and timings.
//!
//! Every low-level file operation records its count and wall time here so a
//! run can be broken down by where the I/O time actually went. An `IoStats`
//! is owned by a single worker; workers merge their stats at the end via
//! `Add` rather than sharing one instance behind a lock.

use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
pub struct IoStats {
    pub create_read_count: u64,
    pub create_read_time: Duration,
    pub read_count: u64,
    pub read_time: Duration,
    pub close_read_count: u64,
    pub close_read_time: Duration,

    pub create_write_count: u64,
    pub create_write_time: Duration,
    pub write_count: u64,
    pub write_time: Duration,
    pub close_write_count: u64,
    pub close_write_time: Duration,

    pub create_link_count: u64,
    pub create_link_time: Duration,
    pub delete_file_count: u64,
    pub delete_file_time: Duration,
    pub move_file_count: u64,
    pub move_file_time: Duration,
    pub remove_dir_count: u64,
    pub remove_dir_time: Duration,
    pub set_last_write_time_count: u64,
    pub set_last_write_time: Duration,
    pub find_file_count: u64,
    pub find_file_time: Duration,
    pub file_info_count: u64,
    pub file_info_time: Duration,
    pub create_dir_count: u64,
    pub create_dir_time: Duration,
    pub copy_file_count: u64,
    pub copy_file_time: Duration,
}

impl std::ops::Add for IoStats {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            create_read_count: self.create_read_count + other.create_read_count,
            create_read_time: self.create_read_time + other.create_read_time,
            read_count: self.read_count + other.read_count,
            read_time: self.read_time + other.read_time,
            close_read_count: self.close_read_count + other.close_read_count,
            close_read_time: self.close_read_time + other.close_read_time,
            create_write_count: self.create_write_count + other.create_write_count,
            create_write_time: self.create_write_time + other.create_write_time,
            write_count: self.write_count + other.write_count,
            write_time: self.write_time + other.write_time,
            close_write_count: self.close_write_count + other.close_write_count,
            close_write_time: self.close_write_time + other.close_write_time,
            create_link_count: self.create_link_count + other.create_link_count,
            create_link_time: self.create_link_time + other.create_link_time,
            delete_file_count: self.delete_file_count + other.delete_file_count,
            delete_file_time: self.delete_file_time + other.delete_file_time,
            move_file_count: self.move_file_count + other.move_file_count,
            move_file_time: self.move_file_time + other.move_file_time,
            remove_dir_count: self.remove_dir_count + other.remove_dir_count,
            remove_dir_time: self.remove_dir_time + other.remove_dir_time,
            set_last_write_time_count: self.set_last_write_time_count
                + other.set_last_write_time_count,
            set_last_write_time: self.set_last_write_time + other.set_last_write_time,
            find_file_count: self.find_file_count + other.find_file_count,
            find_file_time: self.find_file_time + other.find_file_time,
            file_info_count: self.file_info_count + other.file_info_count,
            file_info_time: self.file_info_time + other.file_info_time,
            create_dir_count: self.create_dir_count + other.create_dir_count,
            create_dir_time: self.create_dir_time + other.create_dir_time,
            copy_file_count: self.copy_file_count + other.copy_file_count,
            copy_file_time: self.copy_file_time + other.copy_file_time,
        }
    }
}

impl std::fmt::Display for IoStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let rows = [
            ("open (read)", self.create_read_count, self.create_read_time),
            ("read", self.read_count, self.read_time),
            ("close (read)", self.close_read_count, self.close_read_time),
            (
                "open (write)",
                self.create_write_count,
                self.create_write_time,
            ),
            ("write", self.write_count, self.write_time),
            (
                "close (write)",
                self.close_write_count,
                self.close_write_time,
            ),
            ("link", self.create_link_count, self.create_link_time),
            ("delete", self.delete_file_count, self.delete_file_time),
            ("move", self.move_file_count, self.move_file_time),
            ("rmdir", self.remove_dir_count, self.remove_dir_time),
            (
                "set mtime",
                self.set_last_write_time_count,
                self.set_last_write_time,
            ),
            ("find", self.find_file_count, self.find_file_time),
            ("stat", self.file_info_count, self.file_info_time),
            ("mkdir", self.create_dir_count, self.create_dir_time),
            ("system copy", self.copy_file_count, self.copy_file_time),
        ];
        for (name, count, time) in rows {
            if count == 0 {
                continue;
            }
            writeln!(f, "{:<14} {:>10}  {:>12.2?}", name, count, time)?;
        }
        Ok(())
    }
}

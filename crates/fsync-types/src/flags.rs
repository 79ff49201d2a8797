//! Access rights and object attribute flags.

bitflags::bitflags! {
    /// Requested access rights for a new object handle.
    ///
    /// Only the rights relevant to semaphores are named; every other bit is
    /// retained as-is and forwarded to the authority untouched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMask: u32 {
        const QUERY_STATE = 0x0000_0001;
        const MODIFY_STATE = 0x0000_0002;
        const DELETE = 0x0001_0000;
        const READ_CONTROL = 0x0002_0000;
        const WRITE_DAC = 0x0004_0000;
        const WRITE_OWNER = 0x0008_0000;
        const SYNCHRONIZE = 0x0010_0000;
        const STANDARD_RIGHTS_REQUIRED = 0x000F_0000;
        const SEMAPHORE_ALL_ACCESS = 0x001F_0003;

        const _ = !0;
    }
}

bitflags::bitflags! {
    /// `OBJ_*` flags carried in object attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u32 {
        const INHERIT = 0x0000_0002;
        const PERMANENT = 0x0000_0010;
        const EXCLUSIVE = 0x0000_0020;
        const CASE_INSENSITIVE = 0x0000_0040;
        const OPENIF = 0x0000_0080;
        const OPENLINK = 0x0000_0100;

        const _ = !0;
    }
}

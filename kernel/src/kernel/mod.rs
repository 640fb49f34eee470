// kernel/src/kernel/mod.rs
//
// parcel-os: タスク + mailbox IPC + サービスレジストリのミニカーネル核
//
// - Task: TaskId + TaskState + mailbox（固定長リング）
// - IPC: 非同期 send / ブロッキング receive / フィルタ付き receive
// - Registry: ServiceKind → TaskId の対応と、登録待ちの購読通知
//
// [設計上の不変条件（このモジュールにおける仕様）]
//
// 1. Running は高々 1 タスクで、それは tasks[current_task] である。
// 2. state == Blocked ⇔ blocked_reason.is_some()。
//    Blocked タスクは ready queue に入っていない。
// 3. mailbox はタスクごとに独立で、同一送信者からのメッセージは FIFO 順で届く。
// 4. registry が指す TaskId はすべて実在するタスクである。
//
// これらは debug_check_invariants() でログ出力ベースで検証される。
// 「前提崩れ」は panic せず、ログ＋return（fail-safe）で状態破壊を避ける。

pub mod core_local;
#[cfg(not(test))]
pub mod entry;
pub mod ipc;
pub mod message;
pub mod registry;
pub mod syscall;
pub mod trace;

use crate::logging;

use message::{Message, MessageNamespace};
use registry::{ServiceKind, MAX_SUBSCRIBERS, SERVICE_KIND_COUNT};
use syscall::Syscall;

pub const MAX_TASKS: usize = 8;
const EVENT_LOG_CAP: usize = 256;

/// タスクあたりの mailbox 容量（封筒の数）。
pub const MAILBOX_CAP: usize = 8;

/// カーネル自身が送信者になるときの擬似 TaskId（レジストリ通知など）。
pub const KERNEL_TASK_ID: TaskId = TaskId(0);

//
// ──────────────────────────────────────────────
// TaskId / TaskState / BlockedReason / Task
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
}

/// Blocked の理由。wake 時の配達判定に使う。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    /// 無条件 receive 待ち。どんなメッセージでも起こす。
    Receive,
    /// フィルタ付き receive 待ち。一致しない着信は破棄される（lossy、仕様）。
    FilteredReceive {
        namespace: MessageNamespace,
        message_id: u32,
    },
}

/// タスクごとの受信リング。先着順（FIFO）。
#[derive(Clone, Copy)]
pub struct Mailbox {
    slots: [Option<Message>; MAILBOX_CAP],
    head: usize,
    len: usize,
}

impl Mailbox {
    pub const fn new() -> Self {
        Mailbox {
            slots: [None; MAILBOX_CAP],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 末尾に積む。満杯なら false。
    fn push(&mut self, msg: Message) -> bool {
        if self.len >= MAILBOX_CAP {
            return false;
        }
        let tail = (self.head + self.len) % MAILBOX_CAP;
        self.slots[tail] = Some(msg);
        self.len += 1;
        true
    }

    /// 先頭から取り出す。
    fn pop(&mut self) -> Option<Message> {
        if self.len == 0 {
            return None;
        }
        let msg = self.slots[self.head].take();
        self.head = (self.head + 1) % MAILBOX_CAP;
        self.len -= 1;
        msg
    }
}

#[derive(Clone, Copy)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    pub blocked_reason: Option<BlockedReason>,
    pub mailbox: Mailbox,
    /// 直近の receive 系 syscall が配達したメッセージ。
    pub last_received: Option<Message>,
    /// 次の step() で処理される syscall。
    pub pending_syscall: Option<Syscall>,
}

impl Task {
    const fn new(id: TaskId) -> Self {
        Task {
            id,
            state: TaskState::Ready,
            blocked_reason: None,
            mailbox: Mailbox::new(),
            last_received: None,
            pending_syscall: None,
        }
    }
}

//
// ──────────────────────────────────────────────
// LogEvent（抽象イベントログ）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy)]
pub enum LogEvent {
    SyscallIssued {
        task: TaskId,
    },
    SyscallHandled {
        task: TaskId,
    },
    MessageQueued {
        sender: TaskId,
        receiver: TaskId,
        namespace: MessageNamespace,
        message_id: u32,
    },
    MessageDelivered {
        receiver: TaskId,
        namespace: MessageNamespace,
        message_id: u32,
    },
    /// フィルタ不一致で着信が破棄された（lossy receive の観測点）。
    MessageDiscarded {
        receiver: TaskId,
        namespace: MessageNamespace,
        message_id: u32,
    },
    ReceiveBlocked(TaskId),
    TaskStateChanged(TaskId, TaskState),
    TaskSwitched(TaskId),
    ReadyQueued(TaskId),
    ReadyDequeued(TaskId),
    ServiceRegistered {
        kind: ServiceKind,
        provider: TaskId,
    },
    ServiceNotified {
        kind: ServiceKind,
        subscriber: TaskId,
    },
}

//
// ──────────────────────────────────────────────
// Counters（fastpath/slowpath 観測）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Default)]
pub struct Counters {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_discarded: u64,
    /// mailbox から即時に取れた receive。
    pub recv_immediate: u64,
    /// ブロックに入った receive。
    pub recv_blocked: u64,
}

//
// ──────────────────────────────────────────────
// KernelState（OS全体の状態）
// ──────────────────────────────────────────────
//

pub struct KernelState {
    tasks: [Task; MAX_TASKS],
    num_tasks: usize,
    current_task: usize,

    // ReadyQueue（タスク index のリングバッファ）
    ready_queue: [usize; MAX_TASKS],
    rq_head: usize,
    rq_len: usize,

    // サービスレジストリ（kind → 提供タスク）
    services: [Option<TaskId>; SERVICE_KIND_COUNT],
    // 登録待ちの購読者（kind ごと）
    subscribers: [[Option<TaskId>; MAX_SUBSCRIBERS]; SERVICE_KIND_COUNT],

    // 抽象イベントログ
    event_log: [Option<LogEvent>; EVENT_LOG_CAP],
    event_log_len: usize,

    counters: Counters,
}

impl KernelState {
    /// num_tasks 個のタスクで初期化する。index 0 が Running、残りは Ready。
    /// TaskId は 1 始まり（0 はカーネル擬似 ID）。
    pub fn new(num_tasks: usize) -> Self {
        let mut count = num_tasks;
        if count == 0 || count > MAX_TASKS {
            logging::error("kernel: invalid num_tasks; clamping");
            logging::error_kv(" requested", num_tasks as u64);
            count = count.clamp(1, MAX_TASKS);
        }

        let mut tasks = [Task::new(KERNEL_TASK_ID); MAX_TASKS];
        for (i, task) in tasks.iter_mut().enumerate().take(count) {
            *task = Task::new(TaskId(i as u32 + 1));
        }
        tasks[0].state = TaskState::Running;

        let mut state = KernelState {
            tasks,
            num_tasks: count,
            current_task: 0,

            ready_queue: [0; MAX_TASKS],
            rq_head: 0,
            rq_len: 0,

            services: [None; SERVICE_KIND_COUNT],
            subscribers: [[None; MAX_SUBSCRIBERS]; SERVICE_KIND_COUNT],

            event_log: [None; EVENT_LOG_CAP],
            event_log_len: 0,

            counters: Counters::default(),
        };

        for idx in 1..count {
            state.enqueue_ready(idx);
        }

        state
    }

    pub(super) fn push_event(&mut self, ev: LogEvent) {
        if self.event_log_len < EVENT_LOG_CAP {
            self.event_log[self.event_log_len] = Some(ev);
            self.event_log_len += 1;
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    pub fn current_task_index(&self) -> usize {
        self.current_task
    }

    pub fn task(&self, idx: usize) -> &Task {
        &self.tasks[idx]
    }

    pub fn task_index_of(&self, id: TaskId) -> Option<usize> {
        self.tasks
            .iter()
            .take(self.num_tasks)
            .position(|t| t.id == id)
    }

    /// 次の step() で処理する syscall を積む（タスクのユーザ側コードの代役）。
    pub fn set_pending_syscall(&mut self, idx: usize, sc: Syscall) {
        if idx >= self.num_tasks {
            logging::error("kernel: set_pending_syscall for missing task; ignored");
            logging::error_kv(" task_index", idx as u64);
            return;
        }
        self.tasks[idx].pending_syscall = Some(sc);
    }

    //
    // ReadyQueue
    //
    fn enqueue_ready(&mut self, idx: usize) {
        if self.rq_len >= MAX_TASKS {
            logging::error("kernel: ready queue overflow; dropping enqueue");
            return;
        }
        let tail = (self.rq_head + self.rq_len) % MAX_TASKS;
        self.ready_queue[tail] = idx;
        self.rq_len += 1;

        self.push_event(LogEvent::ReadyQueued(self.tasks[idx].id));
    }

    fn dequeue_ready(&mut self) -> Option<usize> {
        if self.rq_len == 0 {
            return None;
        }
        let idx = self.ready_queue[self.rq_head];
        self.rq_head = (self.rq_head + 1) % MAX_TASKS;
        self.rq_len -= 1;

        self.push_event(LogEvent::ReadyDequeued(self.tasks[idx].id));
        Some(idx)
    }

    //
    // Blocked / Wake
    //
    pub(super) fn block_current(&mut self, reason: BlockedReason) {
        let idx = self.current_task;
        let id = self.tasks[idx].id;

        self.tasks[idx].state = TaskState::Blocked;
        self.tasks[idx].blocked_reason = Some(reason);

        self.push_event(LogEvent::TaskStateChanged(id, TaskState::Blocked));
        self.push_event(LogEvent::ReceiveBlocked(id));
    }

    /// Blocked タスクを起こし、配達メッセージがあれば last_received に置く。
    pub(super) fn wake_task(&mut self, idx: usize, delivered: Option<Message>) {
        let id = self.tasks[idx].id;

        if self.tasks[idx].state != TaskState::Blocked {
            logging::error("kernel: wake of non-blocked task; ignored");
            logging::error_kv(" task_id", id.0 as u64);
            return;
        }

        self.tasks[idx].state = TaskState::Ready;
        self.tasks[idx].blocked_reason = None;
        if delivered.is_some() {
            self.tasks[idx].last_received = delivered;
        }

        self.push_event(LogEvent::TaskStateChanged(id, TaskState::Ready));
        self.enqueue_ready(idx);
    }

    //
    // スケジューラ（FIFO ラウンドロビン）
    //
    pub fn schedule_next_task(&mut self) {
        let prev_idx = self.current_task;
        let prev_id = self.tasks[prev_idx].id;

        if self.tasks[prev_idx].state == TaskState::Running {
            self.tasks[prev_idx].state = TaskState::Ready;
            self.push_event(LogEvent::TaskStateChanged(prev_id, TaskState::Ready));
            self.enqueue_ready(prev_idx);
        }

        if let Some(next_idx) = self.dequeue_ready() {
            let next_id = self.tasks[next_idx].id;

            self.tasks[next_idx].state = TaskState::Running;
            self.current_task = next_idx;

            self.push_event(LogEvent::TaskSwitched(next_id));
            self.push_event(LogEvent::TaskStateChanged(next_id, TaskState::Running));
        } else {
            logging::info("kernel: no ready tasks; scheduler idle");
        }
    }

    /// 1 ステップ: 現在タスクの pending syscall を処理してから切り替える。
    pub fn step(&mut self) {
        self.handle_pending_syscall_if_any();
        self.debug_check_invariants();
        self.schedule_next_task();
    }

    //
    // 簡易的な不変条件チェック（デバッグ用）
    //
    /// 違反はログに残す。戻り値はテストからの観測用。
    pub fn debug_check_invariants(&self) -> bool {
        let mut ok = true;

        // 1. Running は高々 1 つで current_task と一致
        for (idx, task) in self.tasks.iter().enumerate().take(self.num_tasks) {
            if task.state == TaskState::Running && idx != self.current_task {
                logging::error("INVARIANT VIOLATION: running task is not current_task");
                logging::error_kv(" task_index", idx as u64);
                ok = false;
            }
        }

        // 2. Blocked ⇔ blocked_reason
        for (idx, task) in self.tasks.iter().enumerate().take(self.num_tasks) {
            let is_blocked = task.state == TaskState::Blocked;
            if is_blocked != task.blocked_reason.is_some() {
                logging::error("INVARIANT VIOLATION: blocked state and reason disagree");
                logging::error_kv(" task_index", idx as u64);
                ok = false;
            }
        }

        // 3. ready queue のエントリは Ready タスクのみ
        for offset in 0..self.rq_len {
            let pos = (self.rq_head + offset) % MAX_TASKS;
            let idx = self.ready_queue[pos];
            if idx >= self.num_tasks {
                logging::error("INVARIANT VIOLATION: ready queue holds missing task");
                logging::error_kv(" task_index", idx as u64);
                ok = false;
                continue;
            }
            if self.tasks[idx].state != TaskState::Ready {
                logging::error("INVARIANT VIOLATION: ready queue holds non-ready task");
                logging::error_kv(" task_index", idx as u64);
                ok = false;
            }
        }

        // 4. registry が指す TaskId は実在する
        for slot in self.services.iter().flatten() {
            if self.task_index_of(*slot).is_none() {
                logging::error("INVARIANT VIOLATION: registry points at missing task");
                logging::error_kv(" task_id", slot.0 as u64);
                ok = false;
            }
        }

        ok
    }

    //
    // dump_events()
    //
    pub fn dump_events(&self) {
        logging::info("=== KernelState Event Log Dump ===");

        for i in 0..self.event_log_len {
            if let Some(ev) = self.event_log[i] {
                log_event(ev);
            }
        }

        logging::info("=== End of Event Log ===");

        logging::info("=== IPC Counters ===");
        logging::info_u64(" messages_sent", self.counters.messages_sent);
        logging::info_u64(" messages_delivered", self.counters.messages_delivered);
        logging::info_u64(" messages_discarded", self.counters.messages_discarded);
        logging::info_u64(" recv_immediate", self.counters.recv_immediate);
        logging::info_u64(" recv_blocked", self.counters.recv_blocked);
    }

    /// テスト用: イベントログの中身をクロージャで観察する。
    pub fn for_each_event<F>(&self, mut f: F)
    where
        F: FnMut(&LogEvent),
    {
        for i in 0..self.event_log_len {
            if let Some(ref ev) = self.event_log[i] {
                f(ev);
            }
        }
    }
}

// ─────────────────────────────────────────────
// LogEvent → ログ出力
// ─────────────────────────────────────────────

fn log_event(ev: LogEvent) {
    match ev {
        LogEvent::SyscallIssued { task } => {
            logging::info("EVENT: SyscallIssued");
            logging::info_u64(" task", task.0 as u64);
        }
        LogEvent::SyscallHandled { task } => {
            logging::info("EVENT: SyscallHandled");
            logging::info_u64(" task", task.0 as u64);
        }
        LogEvent::MessageQueued {
            sender,
            receiver,
            namespace,
            message_id,
        } => {
            logging::info("EVENT: MessageQueued");
            logging::info_u64(" sender", sender.0 as u64);
            logging::info_u64(" receiver", receiver.0 as u64);
            logging::info_u64(" namespace", namespace as u64);
            logging::info_u64(" message_id", message_id as u64);
        }
        LogEvent::MessageDelivered {
            receiver,
            namespace,
            message_id,
        } => {
            logging::info("EVENT: MessageDelivered");
            logging::info_u64(" receiver", receiver.0 as u64);
            logging::info_u64(" namespace", namespace as u64);
            logging::info_u64(" message_id", message_id as u64);
        }
        LogEvent::MessageDiscarded {
            receiver,
            namespace,
            message_id,
        } => {
            logging::info("EVENT: MessageDiscarded");
            logging::info_u64(" receiver", receiver.0 as u64);
            logging::info_u64(" namespace", namespace as u64);
            logging::info_u64(" message_id", message_id as u64);
        }
        LogEvent::ReceiveBlocked(tid) => {
            logging::info("EVENT: ReceiveBlocked");
            logging::info_u64(" task", tid.0 as u64);
        }
        LogEvent::TaskStateChanged(tid, state) => {
            logging::info("EVENT: TaskStateChanged");
            logging::info_u64(" task", tid.0 as u64);
            match state {
                TaskState::Ready => logging::info(" to READY"),
                TaskState::Running => logging::info(" to RUNNING"),
                TaskState::Blocked => logging::info(" to BLOCKED"),
            }
        }
        LogEvent::TaskSwitched(tid) => {
            logging::info("EVENT: TaskSwitched");
            logging::info_u64(" task", tid.0 as u64);
        }
        LogEvent::ReadyQueued(tid) => {
            logging::info("EVENT: ReadyQueued");
            logging::info_u64(" task", tid.0 as u64);
        }
        LogEvent::ReadyDequeued(tid) => {
            logging::info("EVENT: ReadyDequeued");
            logging::info_u64(" task", tid.0 as u64);
        }
        LogEvent::ServiceRegistered { kind, provider } => {
            logging::info("EVENT: ServiceRegistered");
            logging::info_u64(" kind", kind as u64);
            logging::info_u64(" provider", provider.0 as u64);
        }
        LogEvent::ServiceNotified { kind, subscriber } => {
            logging::info("EVENT: ServiceNotified");
            logging::info_u64(" kind", kind as u64);
            logging::info_u64(" subscriber", subscriber.0 as u64);
        }
    }
}

//! The tracing loop: walks each pending object's schema, feeds its
//! references through the batching pipeline into the reachability
//! processor, and keeps workers fed through work stealing until the whole
//! transitive closure is visited.

pub(crate) mod batcher;
pub(crate) mod processor;

use crate::object::cluster::ClusterTable;
use crate::object::layout::{FieldPathSlot, UntypedArray};
use crate::object::schema::{AroFn, Member, MemberKind, Origin, ReferenceCollector, Schema};
use crate::object::table::ObjectTable;
use crate::scheduler::aro::SlowAroManager;
use crate::scheduler::context::WorkerContext;
use crate::scheduler::queue::{QueueManager, WorkBlock, BLOCK_CAPACITY};
use crate::util::constants::OBJECT_LOOKAHEAD;
use crate::util::pages::PageAllocator;
use crate::util::{Address, ObjectRef};
use crate::vm::Binding;
use batcher::{BatchSink, RefMetadata, RefView, ReferenceBatcher, ResolvedMutableRef, StructArrayJob, StructBlockifier};
use processor::ProcEnv;
use std::marker::PhantomData;

/// Shared state a tracing pass runs against.
pub(crate) struct TraceEnv<'e, VM: Binding> {
    pub table: &'e ObjectTable,
    pub clusters: &'e ClusterTable,
    pub pages: &'e PageAllocator,
    pub queues: &'e QueueManager,
    pub slow_aro: &'e SlowAroManager,
    /// Attribute references that keep garbage alive (direct mode only).
    pub track_garbage: bool,
    pub _vm: PhantomData<fn() -> VM>,
}

impl<'e, VM: Binding> Clone for TraceEnv<'e, VM> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'e, VM: Binding> Copy for TraceEnv<'e, VM> {}

impl<'e, VM: Binding> TraceEnv<'e, VM> {
    fn proc_env(&self) -> ProcEnv<'e> {
        ProcEnv {
            table: self.table,
            clusters: self.clusters,
        }
    }
}

/// What a workless worker managed to scrounge up.
enum Loot {
    Block(*mut WorkBlock),
    Aro,
    Context {
        backing: Vec<ObjectRef>,
        live: usize,
        native: Vec<Address>,
    },
    Nothing,
}

/// How a member walk routes what it finds. The batched dispatcher stages
/// everything; the direct dispatcher processes in place with attribution.
trait MemberDispatch<VM: Binding>: ReferenceCollector + Sized {
    fn reference_slot(&mut self, slot: Address, killable: bool, member: &Member);
    fn reference_view(&mut self, view: RefView, killable: bool, member: &Member);
    fn weak_slot(&mut self, slot: Address);
    fn struct_array(&mut self, schema: &Schema, array: UntypedArray, owner: ObjectRef);
    fn callback(&mut self, owner: ObjectRef, callback: AroFn);
    fn slow_callback(&mut self, owner: ObjectRef, index: u32, callback: AroFn);
}

/// Walks one schema over one object (or struct element) at `base`.
fn visit_members<VM: Binding, D: MemberDispatch<VM>>(
    dispatch: &mut D,
    schema: &Schema,
    base: Address,
    owner: ObjectRef,
) {
    for member in schema.members() {
        let at = base + member.offset as usize;
        let killable = member.origin == Origin::Script;
        match &member.kind {
            MemberKind::Reference => dispatch.reference_slot(at, killable, member),
            MemberKind::Weak => dispatch.weak_slot(at),
            MemberKind::ReferenceArray | MemberKind::FreezableReferenceArray => {
                let array = unsafe { at.load::<UntypedArray>() };
                if array.num > 0 {
                    dispatch.reference_view(
                        RefView {
                            data: array.data,
                            num: array.num as usize,
                        },
                        killable,
                        member,
                    );
                }
            }
            MemberKind::StructArray(element)
            | MemberKind::SparseStructArray(element)
            | MemberKind::FreezableStructArray(element) => {
                let array = unsafe { at.load::<UntypedArray>() };
                if array.num > 0 {
                    dispatch.struct_array(element, array, owner);
                }
            }
            MemberKind::Optional(payload) => {
                let present =
                    unsafe { (at + payload.struct_stride() as usize).load::<u8>() } != 0;
                if present {
                    visit_members(dispatch, payload, at, owner);
                }
            }
            MemberKind::FieldPath => dispatch.reference_slot(at, false, member),
            MemberKind::FieldPathArray => {
                let array = unsafe { at.load::<UntypedArray>() };
                for idx in 0..array.num.max(0) as usize {
                    let slot = array.data + idx * std::mem::size_of::<FieldPathSlot>();
                    dispatch.reference_slot(slot, false, member);
                }
            }
            MemberKind::Callback(callback) => dispatch.callback(owner, *callback),
            MemberKind::SlowCallback { index, callback } => {
                dispatch.slow_callback(owner, *index, *callback)
            }
        }
    }
}

/// Lands drained batches on the reachability processor.
struct ProcessorSink<'a, const PARALLEL: bool, const WITH_KILL: bool> {
    env: ProcEnv<'a>,
    ctx: &'a mut WorkerContext,
}

impl<'a, const PARALLEL: bool, const WITH_KILL: bool> BatchSink
    for ProcessorSink<'a, PARALLEL, WITH_KILL>
{
    fn count_references(&mut self, num: usize) {
        self.ctx.stats.add_references(num as u64);
    }

    fn handle_mutable(&mut self, reference: ResolvedMutableRef, metadata: RefMetadata<'_>) {
        processor::handle_batched_mutable::<PARALLEL>(self.env, self.ctx, reference, metadata);
    }

    fn handle_immutable(&mut self, object: ObjectRef, metadata: RefMetadata<'_>) {
        processor::handle_batched_immutable::<PARALLEL, WITH_KILL>(
            self.env, self.ctx, object, metadata,
        );
    }
}

/// The throughput path: batches references before dispatching them to the
/// processor.
struct BatchDispatcher<'e, 'c, VM: Binding, const PARALLEL: bool, const WITH_KILL: bool> {
    env: TraceEnv<'e, VM>,
    ctx: &'c mut WorkerContext,
    killable: ReferenceBatcher<true>,
    immutable: ReferenceBatcher<false>,
    structs: StructBlockifier,
}

macro_rules! sink {
    ($self:ident) => {
        ProcessorSink::<PARALLEL, WITH_KILL> {
            env: $self.env.proc_env(),
            ctx: &mut *$self.ctx,
        }
    };
}

impl<'e, 'c, VM: Binding, const PARALLEL: bool, const WITH_KILL: bool>
    BatchDispatcher<'e, 'c, VM, PARALLEL, WITH_KILL>
{
    fn new(env: TraceEnv<'e, VM>, ctx: &'c mut WorkerContext) -> Box<Self> {
        let structs = StructBlockifier::new(ctx.worker_index(), env.pages);
        Box::new(BatchDispatcher {
            env,
            ctx,
            killable: ReferenceBatcher::new(),
            immutable: ReferenceBatcher::new(),
            structs,
        })
    }

    fn visit_object(&mut self, object: ObjectRef) {
        debug_assert!(!object.is_null());
        self.ctx.stats.add_objects(1);
        self.ctx.referencing_object = object;
        let class = VM::class_of(object);
        visit_members::<VM, Self>(self, &class.schema, object.to_address(), object);

        // Drain our own unbalanced slow-callback queues between objects so
        // one expensive caller cannot pile up unbounded work.
        let worker = self.ctx.worker_index();
        let aro = self.env.slow_aro;
        aro.process_unbalanced_calls(worker, |callback, obj| {
            self.ctx.referencing_object = obj;
            callback(obj, &mut *self);
        });
    }

    fn process_padded_slice(&mut self, backing: &[ObjectRef], live: usize) {
        debug_assert!(backing.is_empty() || backing.len() >= live);
        for idx in 0..live {
            if idx + OBJECT_LOOKAHEAD < backing.len() {
                backing[idx + OBJECT_LOOKAHEAD].to_address().prefetch_read();
            }
            self.visit_object(backing[idx]);
        }
    }

    fn process_block(&mut self, block: *mut WorkBlock, num: usize) {
        let objects = unsafe { (*block).padded() };
        for idx in 0..num {
            objects[idx + OBJECT_LOOKAHEAD].to_address().prefetch_read();
            self.visit_object(objects[idx]);
        }
        self.ctx.objects_to_serialize.free_owning_block(block);
    }

    fn has_staged_work(&self) -> bool {
        !self.killable.is_empty() || !self.immutable.is_empty() || self.structs.can_pop()
    }

    fn flush_ref_queues(&mut self) {
        let table = self.env.table;
        let mut sink = sink!(self);
        self.killable.flush::<VM>(table, &mut sink);
        let mut sink = sink!(self);
        self.immutable.flush::<VM>(table, &mut sink);
    }

    /// Drains queued struct-array jobs, visiting each element through its
    /// schema. Element visits may stage more references and more jobs.
    fn process_structs(&mut self) {
        while let Some((block, num)) = self.structs.pop_block() {
            let mut jobs: Vec<StructArrayJob> = Vec::with_capacity(num);
            self.structs.consume_block(block, num, |job| jobs.push(job));
            self.structs.free_block(block);

            self.ctx.referencing_object = ObjectRef::NULL;
            for job in jobs {
                debug_assert!(job.num > 0);
                debug_assert_eq!(job.stride, job.schema.struct_stride());
                let mut element = job.data;
                for _ in 0..job.num {
                    visit_members::<VM, Self>(self, &job.schema, element, ObjectRef::NULL);
                    element = element + job.stride as usize;
                }
            }

            self.flush_ref_queues();
        }
    }

    /// Next locally-available full or partial block, flushing the staging
    /// queues when that is the only way to make more.
    fn try_local_block(&mut self) -> Option<(*mut WorkBlock, usize)> {
        loop {
            let popped = if PARALLEL {
                self.ctx.objects_to_serialize.pop_full_block_async()
            } else {
                self.ctx.objects_to_serialize.pop_full_block_sync()
            };
            if let Some(block) = popped {
                return Some((block, BLOCK_CAPACITY));
            }
            if self.has_staged_work() {
                self.flush_ref_queues();
                self.process_structs();
                continue;
            }
            return self.ctx.objects_to_serialize.pop_wip_block();
        }
    }

    fn process_all_slow_aro(&mut self) -> bool {
        let worker = self.ctx.worker_index();
        let aro = self.env.slow_aro;
        aro.process_all_queues(worker, |callback, obj| {
            self.ctx.referencing_object = obj;
            callback(obj, &mut *self);
        })
    }

    /// Out of local work: steal others' blocks, drain slow callbacks, adopt
    /// an unstarted context, or spin with the other workless workers.
    fn steal_work(&mut self, is_driving: bool) -> Loot {
        if let Some(block) = self.ctx.objects_to_serialize.steal_full_block(self.env.queues) {
            return Loot::Block(block);
        }
        if self.process_all_slow_aro() {
            return Loot::Aro;
        }

        let coordinator = unsafe { &*self.ctx.coordinator };
        if let Some(stolen) = coordinator.steal_context() {
            let stolen = unsafe { &mut *stolen };
            let (backing, live) = stolen.take_initial_objects();
            let native = std::mem::take(&mut stolen.initial_native_references);
            return Loot::Context { backing, live, native };
        }

        if coordinator.report_out_of_work(is_driving) {
            while coordinator.keep_spinning() {
                std::thread::yield_now();
                if let Some(block) = self.ctx.objects_to_serialize.steal_full_block(self.env.queues)
                {
                    coordinator.report_back_to_work();
                    return Loot::Block(block);
                }
                if self.process_all_slow_aro() {
                    coordinator.report_back_to_work();
                    return Loot::Aro;
                }
            }
        }

        Loot::Nothing
    }

    fn queue_native_references(&mut self, slots: &[Address]) {
        let table = self.env.table;
        for &slot in slots {
            let mut sink = sink!(self);
            self.immutable.push_slot::<VM>(table, &mut sink, slot);
        }
    }

    fn run(&mut self, is_driving: bool) {
        let native = std::mem::take(&mut self.ctx.initial_native_references);
        self.queue_native_references(&native);

        let (backing, live) = self.ctx.take_initial_objects();
        self.process_padded_slice(&backing, live);

        loop {
            if let Some((block, num)) = self.try_local_block() {
                self.process_block(block, num);
                continue;
            }
            if !PARALLEL {
                break;
            }
            match self.steal_work(is_driving) {
                Loot::Block(block) => self.process_block(block, BLOCK_CAPACITY),
                Loot::Aro => {}
                Loot::Context { backing, live, native } => {
                    self.queue_native_references(&native);
                    self.process_padded_slice(&backing, live);
                }
                Loot::Nothing => break,
            }
        }

        debug_assert!(!self.has_staged_work());
        debug_assert_eq!(self.ctx.objects_to_serialize.partial_num(), 0);
        self.structs.detach();
    }
}

impl<'e, 'c, VM: Binding, const PARALLEL: bool, const WITH_KILL: bool> MemberDispatch<VM>
    for BatchDispatcher<'e, 'c, VM, PARALLEL, WITH_KILL>
{
    fn reference_slot(&mut self, slot: Address, killable: bool, _member: &Member) {
        let table = self.env.table;
        let mut sink = sink!(self);
        if killable || WITH_KILL {
            self.killable.push_slot::<VM>(table, &mut sink, slot);
        } else {
            self.immutable.push_slot::<VM>(table, &mut sink, slot);
        }
    }

    fn reference_view(&mut self, view: RefView, killable: bool, _member: &Member) {
        let table = self.env.table;
        let mut sink = sink!(self);
        if killable || WITH_KILL {
            self.killable.push_view::<VM>(table, &mut sink, view);
        } else {
            self.immutable.push_view::<VM>(table, &mut sink, view);
        }
    }

    fn weak_slot(&mut self, slot: Address) {
        self.ctx.weak_references.push(slot);
    }

    fn struct_array(&mut self, schema: &Schema, array: UntypedArray, _owner: ObjectRef) {
        self.structs.push(StructArrayJob {
            schema: schema.clone(),
            data: array.data,
            num: array.num as u32,
            stride: schema.struct_stride(),
        });
    }

    fn callback(&mut self, owner: ObjectRef, callback: AroFn) {
        self.ctx.referencing_object = owner;
        callback(owner, &mut *self);
    }

    fn slow_callback(&mut self, owner: ObjectRef, index: u32, callback: AroFn) {
        let worker = self.ctx.worker_index();
        if PARALLEL && self.env.slow_aro.try_queue_call(index, worker, self.env.pages, owner) {
            return;
        }
        // Store exhausted or serial cycle: dispatch synchronously.
        self.ctx.referencing_object = owner;
        callback(owner, &mut *self);
    }
}

impl<'e, 'c, VM: Binding, const PARALLEL: bool, const WITH_KILL: bool> ReferenceCollector
    for BatchDispatcher<'e, 'c, VM, PARALLEL, WITH_KILL>
{
    fn add_killable_reference(&mut self, slot: &mut ObjectRef) {
        let address = Address::from_mut_ptr(slot);
        let table = self.env.table;
        let mut sink = sink!(self);
        if WITH_KILL {
            self.killable.push_slot::<VM>(table, &mut sink, address);
        } else {
            self.immutable.push_slot::<VM>(table, &mut sink, address);
        }
    }

    fn add_reference(&mut self, object: ObjectRef) {
        let table = self.env.table;
        let mut sink = sink!(self);
        self.immutable.push_value::<VM>(table, &mut sink, object);
    }

    fn add_references(&mut self, slots: &mut [ObjectRef]) {
        let view = RefView {
            data: Address::from_mut_ptr(slots.as_mut_ptr()),
            num: slots.len(),
        };
        let table = self.env.table;
        let mut sink = sink!(self);
        if WITH_KILL {
            self.killable.push_view::<VM>(table, &mut sink, view);
        } else {
            self.immutable.push_view::<VM>(table, &mut sink, view);
        }
    }

    fn add_weak_reference(&mut self, slot: &mut ObjectRef) {
        self.ctx.weak_references.push(Address::from_mut_ptr(slot));
    }
}

/// The attribution path: serial, unbatched, knows who referenced what.
/// Used by the garbage-tracking rerun and the history pass.
struct DirectDispatcher<'e, 'c, VM: Binding, const WITH_KILL: bool> {
    env: TraceEnv<'e, VM>,
    ctx: &'c mut WorkerContext,
}

impl<'e, 'c, VM: Binding, const WITH_KILL: bool> DirectDispatcher<'e, 'c, VM, WITH_KILL> {
    fn visit_object(&mut self, object: ObjectRef) {
        self.ctx.stats.add_objects(1);
        self.ctx.referencing_object = object;
        let class = VM::class_of(object);
        visit_members::<VM, Self>(self, &class.schema, object.to_address(), object);
    }

    fn run(&mut self) {
        let native = std::mem::take(&mut self.ctx.initial_native_references);
        self.ctx.referencing_object = ObjectRef::NULL;
        for slot in native {
            processor::process_slot_direct::<VM, false, WITH_KILL>(
                self.env.proc_env(),
                self.ctx,
                ObjectRef::NULL,
                slot,
                "native reference",
                false,
                self.env.track_garbage,
            );
        }

        let (backing, live) = self.ctx.take_initial_objects();
        for &object in &backing[..live] {
            self.visit_object(object);
        }

        loop {
            if let Some(block) = self.ctx.objects_to_serialize.pop_full_block_sync() {
                let objects = unsafe { (*block).padded() };
                for idx in 0..BLOCK_CAPACITY {
                    self.visit_object(objects[idx]);
                }
                self.ctx.objects_to_serialize.free_owning_block(block);
                continue;
            }
            if let Some((block, num)) = self.ctx.objects_to_serialize.pop_wip_block() {
                let objects = unsafe { (*block).padded() };
                for idx in 0..num {
                    self.visit_object(objects[idx]);
                }
                self.ctx.objects_to_serialize.free_owning_block(block);
                continue;
            }
            break;
        }
    }
}

impl<'e, 'c, VM: Binding, const WITH_KILL: bool> MemberDispatch<VM>
    for DirectDispatcher<'e, 'c, VM, WITH_KILL>
{
    fn reference_slot(&mut self, slot: Address, killable: bool, member: &Member) {
        let referencing = self.ctx.referencing_object;
        processor::process_slot_direct::<VM, false, WITH_KILL>(
            self.env.proc_env(),
            self.ctx,
            referencing,
            slot,
            member.name,
            killable || WITH_KILL,
            self.env.track_garbage,
        );
    }

    fn reference_view(&mut self, view: RefView, killable: bool, member: &Member) {
        for idx in 0..view.num {
            self.reference_slot(view.data.shift::<ObjectRef>(idx as isize), killable, member);
        }
    }

    fn weak_slot(&mut self, slot: Address) {
        self.ctx.weak_references.push(slot);
    }

    fn struct_array(&mut self, schema: &Schema, array: UntypedArray, owner: ObjectRef) {
        let mut element = array.data;
        for _ in 0..array.num.max(0) {
            visit_members::<VM, Self>(self, schema, element, owner);
            element = element + schema.struct_stride() as usize;
        }
    }

    fn callback(&mut self, owner: ObjectRef, callback: AroFn) {
        self.ctx.referencing_object = owner;
        callback(owner, &mut *self);
    }

    fn slow_callback(&mut self, owner: ObjectRef, _index: u32, callback: AroFn) {
        self.ctx.referencing_object = owner;
        callback(owner, &mut *self);
    }
}

impl<'e, 'c, VM: Binding, const WITH_KILL: bool> ReferenceCollector
    for DirectDispatcher<'e, 'c, VM, WITH_KILL>
{
    fn add_killable_reference(&mut self, slot: &mut ObjectRef) {
        let referencing = self.ctx.referencing_object;
        processor::process_slot_direct::<VM, false, WITH_KILL>(
            self.env.proc_env(),
            self.ctx,
            referencing,
            Address::from_mut_ptr(slot),
            "callback reference",
            WITH_KILL,
            self.env.track_garbage,
        );
    }

    fn add_reference(&mut self, object: ObjectRef) {
        let referencing = self.ctx.referencing_object;
        processor::process_object_direct::<VM, false, WITH_KILL>(
            self.env.proc_env(),
            self.ctx,
            referencing,
            object,
            "callback reference",
            self.env.track_garbage,
        );
    }

    fn add_weak_reference(&mut self, slot: &mut ObjectRef) {
        self.ctx.weak_references.push(Address::from_mut_ptr(slot));
    }
}

/// Runs one worker's share of a batched reachability pass to completion.
pub(crate) fn collect_references<VM: Binding, const PARALLEL: bool, const WITH_KILL: bool>(
    env: TraceEnv<'_, VM>,
    ctx: &mut WorkerContext,
    is_driving: bool,
) {
    let mut dispatcher = BatchDispatcher::<VM, PARALLEL, WITH_KILL>::new(env, ctx);
    dispatcher.run(is_driving);
}

/// Runs a serial attribution pass (garbage tracking / history).
pub(crate) fn collect_references_direct<VM: Binding, const WITH_KILL: bool>(
    env: TraceEnv<'_, VM>,
    ctx: &mut WorkerContext,
) {
    let mut dispatcher = DirectDispatcher::<VM, WITH_KILL> { env, ctx };
    dispatcher.run();
}

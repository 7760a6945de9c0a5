use std::sync::{Arc, Barrier};
use std::thread;

use pretty_assertions::assert_eq;

use hpalloc::sim::{FallbackCall, SimulatedFallback, SimulatedMemory};
use hpalloc::{
    AllocationRequest, HeapSpill, PageSize, ReservationError, ReserveOptions, Router, parser,
    reserve,
};

const MB: usize = 1 << 20;
const GB: usize = 1 << 30;

fn router(rules: &str, platform: SimulatedMemory) -> (Router, Arc<SimulatedFallback>) {
    let model = parser::parse(&format!("type,page_size,start_offset,end_offset\n{rules}")).unwrap();
    let table = reserve(&model, Arc::new(platform), &ReserveOptions::default()).unwrap();
    let fallback = Arc::new(SimulatedFallback::new());
    let router = Router::new(Arc::new(table), fallback.clone(), HeapSpill::Fallback);
    (router, fallback)
}

#[test]
fn region_smaller_than_its_page_is_a_reservation_error() {
    let model = parser::parse("type,page_size,start_offset,end_offset\nmmap,2MB,0,1MB\n").unwrap();
    let platform = Arc::new(SimulatedMemory::new().with_huge_pages(PageSize::Huge2M, 8));

    let err = reserve(&model, platform, &ReserveOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        ReservationError::MisalignedRange {
            page_size: PageSize::Huge2M,
            start: 0,
            end,
            ..
        } if end == MB
    ));
}

#[test]
fn heap_growth_stays_in_one_gigabyte_pages() {
    let (router, fallback) = router(
        "brk,1GB,0,10GB\n",
        SimulatedMemory::new().with_huge_pages(PageSize::Huge1G, 10),
    );
    let base = router.table().heap().base();

    let mut expected = base;
    for _ in 0..20 {
        assert_eq!(router.heap_growth((256 * MB) as isize), Ok(expected));
        expected += 256 * MB;
    }

    assert_eq!(router.current_break(), base + 5 * GB);
    let region = &router.table().heap().regions()[0];
    assert_eq!(region.page_size(), PageSize::Huge1G);
    assert_eq!(region.used(), 5 * GB);
    assert!(fallback.calls().is_empty());
    assert_eq!(router.stats().heap_splits, 0);
}

#[test]
fn request_larger_than_any_budget_goes_to_the_fallback() {
    let (router, fallback) = router(
        "mmap,64KB,0,1GB\nmmap,2MB,1GB,2GB\n",
        SimulatedMemory::new()
            .with_huge_pages(PageSize::Huge64K, GB / (64 << 10))
            .with_huge_pages(PageSize::Huge2M, GB / (2 * MB)),
    );

    let addr = router.map(&AllocationRequest::anonymous(3 * GB)).unwrap();

    assert_eq!(fallback.calls(), vec![FallbackCall::Alloc { addr, len: 3 * GB }]);
    assert!(router.table().anon_region_at(addr).is_none());
    assert_eq!(router.stats().no_matching_rule, 1);
    for region in router.table().anon_regions() {
        assert_eq!(region.used(), 0);
    }
}

#[test]
fn racing_requests_for_the_last_budget() {
    let (router, fallback) = router(
        "mmap,2MB,0,150MB\n",
        SimulatedMemory::new().with_huge_pages(PageSize::Huge2M, 75),
    );
    let router = Arc::new(router);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let router = Arc::clone(&router);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                router.map(&AllocationRequest::anonymous(100 * MB)).unwrap()
            })
        })
        .collect();
    let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let region = &router.table().anon_regions()[0];
    let in_region = addrs.iter().filter(|&&a| region.contains(a)).count();
    assert_eq!(in_region, 1);
    assert_eq!(region.used(), 100 * MB);
    assert_eq!(region.live_slices().len(), 1);
    assert_eq!(fallback.calls().len(), 1);
    assert_eq!(router.stats().region_hits, 1);
}
